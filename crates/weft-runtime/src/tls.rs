//! Thread-local storage for the running fiber and its surroundings.
//!
//! Every OS thread that touches the runtime has up to four pieces of
//! ambient state: the fiber currently executing, the lazily created
//! thread-main fiber, the scheduler the thread works for, and the
//! reactor (if the scheduler is one). Workers set these on startup;
//! foreign threads see `None` everywhere.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::reactor::IoManager;
use crate::scheduler::Scheduler;

thread_local! {
    /// Worker index within the owning scheduler, usize::MAX off-pool.
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };

    /// Fiber currently executing on this thread.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's main-context fiber, created on first use.
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler this thread works for.
    static SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };

    /// Reactor this thread works for, when the scheduler is an IoManager.
    static REACTOR: RefCell<Option<Arc<IoManager>>> = const { RefCell::new(None) };
}

#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|cell| cell.get())
}

/// Worker index if this thread belongs to a scheduler pool.
#[inline]
pub fn try_worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

#[inline]
pub fn set_current_fiber(fiber: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = fiber);
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

/// The thread-main fiber, creating it with `init` on first call.
pub fn main_fiber_or_init(init: impl FnOnce() -> Arc<Fiber>) -> Arc<Fiber> {
    MAIN_FIBER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(f) = slot.as_ref() {
            return f.clone();
        }
        let f = init();
        *slot = Some(f.clone());
        f
    })
}

#[inline]
pub fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_scheduler(sched: Option<Arc<Scheduler>>) {
    SCHEDULER.with(|cell| *cell.borrow_mut() = sched);
}

#[inline]
pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_reactor(reactor: Option<Arc<IoManager>>) {
    REACTOR.with(|cell| *cell.borrow_mut() = reactor);
}

#[inline]
pub fn reactor() -> Option<Arc<IoManager>> {
    REACTOR.with(|cell| cell.borrow().clone())
}
