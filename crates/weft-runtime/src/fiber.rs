//! Stackful fibers.
//!
//! A [`Fiber`] owns an mmap'd stack and a saved register block, plus a
//! second block (the "link") holding the context of whoever resumed it.
//! `resume` switches from the caller into the fiber; the fiber comes
//! back through the link, either by yielding or by finishing.
//!
//! State changes that a yield implies (Exec -> Ready, Exec -> Hold,
//! Exec -> Term/Except) are not applied by the fiber itself. The fiber
//! records the target in `yield_to` and the resumer commits it after
//! `switch_context` returns, once the fiber's registers are fully
//! saved. Until that commit the fiber still reads as Exec, so nothing
//! can resume it on another thread while its stack is mid-save.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use weft_core::error::SchedResult;
use weft_core::id::{self, FiberId};
use weft_core::state::FiberState;
use weft_core::{kdebug, kerror};

use crate::current_arch::{init_context, switch_context, SavedRegs};
use crate::memory::{self, StackBuffer};
use crate::{config, tls};

/// Sentinel in `yield_to` meaning no pending transition.
const NO_PENDING: u8 = u8::MAX;

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// State to commit once the resumer regains control.
    yield_to: AtomicU8,
    /// The fiber's own saved registers.
    regs: UnsafeCell<SavedRegs>,
    /// Saved context of whoever resumed this fiber last.
    link: UnsafeCell<SavedRegs>,
    cb: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    stack: UnsafeCell<Option<StackBuffer>>,
}

// The UnsafeCells are only touched under the execution protocol: regs
// and link are written by at most one thread at a time (the fiber is
// Exec, or exactly one resumer owns it), and cb is taken once on the
// fiber's own stack.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size.
    pub fn new(cb: impl FnOnce() + Send + 'static) -> SchedResult<Arc<Fiber>> {
        Self::with_stack_size(cb, config::runtime().stack_size)
    }

    /// Create a fiber with an explicit stack size.
    pub fn with_stack_size(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> SchedResult<Arc<Fiber>> {
        let stack = memory::acquire_stack(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: id::next_fiber_id(),
            state: AtomicU8::new(FiberState::Init as u8),
            yield_to: AtomicU8::new(NO_PENDING),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            link: UnsafeCell::new(SavedRegs::zeroed()),
            cb: UnsafeCell::new(Some(Box::new(cb))),
            stack: UnsafeCell::new(Some(stack)),
        });
        // The entry argument is the Arc payload address. The Arc held
        // in thread-local storage keeps it alive while the fiber runs.
        unsafe {
            let top = (*fiber.stack.get())
                .as_ref()
                .map(|s| s.top())
                .expect("fresh fiber has a stack");
            init_context(
                fiber.regs.get(),
                top,
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        id::fiber_created();
        kdebug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// The thread-main fiber wrapping the caller's native context.
    /// Never has its own stack or callback; it is Exec whenever the
    /// thread is not inside some other fiber.
    fn new_main() -> Fiber {
        id::fiber_created();
        Fiber {
            id: id::next_fiber_id(),
            state: AtomicU8::new(FiberState::Exec as u8),
            yield_to: AtomicU8::new(NO_PENDING),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            link: UnsafeCell::new(SavedRegs::zeroed()),
            cb: UnsafeCell::new(None),
            stack: UnsafeCell::new(None),
        }
    }

    /// The fiber currently executing on this thread.
    ///
    /// First use on a thread materializes its main fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = tls::main_fiber_or_init(|| Arc::new(Fiber::new_main()));
        tls::set_current_fiber(Some(main.clone()));
        main
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// Live fiber count across the process.
    pub fn total() -> u64 {
        id::live_fibers()
    }

    /// Switch from the calling context into this fiber.
    ///
    /// Returns when the fiber yields or finishes. The caller's context
    /// is saved in the fiber's link slot, so a fiber always comes back
    /// to whoever resumed it. Any transition the fiber requested while
    /// running is committed here, after its registers are saved.
    pub fn resume(self: &Arc<Self>) {
        let st = self.state();
        assert!(
            st.is_resumable(),
            "resume of fiber {} in state {}",
            self.id,
            st
        );
        let prev = tls::current_fiber();
        self.state
            .store(FiberState::Exec as u8, Ordering::Release);
        tls::set_current_fiber(Some(self.clone()));
        unsafe {
            switch_context(self.link.get(), self.regs.get());
        }
        tls::set_current_fiber(prev);
        self.commit_pending();
    }

    /// Apply the transition recorded by the last yield, if any.
    fn commit_pending(&self) {
        let pending = self.yield_to.swap(NO_PENDING, Ordering::AcqRel);
        if pending != NO_PENDING {
            self.state.store(pending, Ordering::Release);
        }
    }

    /// Yield back to the resumer, leaving this fiber runnable.
    pub fn yield_ready() {
        Self::yield_with(FiberState::Ready);
    }

    /// Yield back to the resumer, parking this fiber until something
    /// explicitly reschedules it.
    pub fn yield_hold() {
        Self::yield_with(FiberState::Hold);
    }

    fn yield_with(target: FiberState) {
        let cur = Fiber::current();
        // Off-fiber (thread-main context) there is no resumer to
        // return to: Ready degrades to an OS yield, Hold to a no-op.
        if unsafe { (*cur.stack.get()).is_none() } {
            if target == FiberState::Ready {
                std::thread::yield_now();
            }
            return;
        }
        cur.yield_to.store(target as u8, Ordering::Release);
        unsafe {
            switch_context(cur.regs.get(), cur.link.get());
        }
    }

    /// Rearm a finished (or never started) fiber with a new callback,
    /// reusing its stack.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        let st = self.state();
        assert!(st.is_resettable(), "reset of fiber {} in state {}", self.id, st);
        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            let top = (*self.stack.get())
                .as_ref()
                .map(|s| s.top())
                .expect("reset of a stackless fiber");
            init_context(
                self.regs.get(),
                top,
                fiber_main as usize,
                self as *const Fiber as usize,
            );
        }
        self.yield_to.store(NO_PENDING, Ordering::Release);
        self.state.store(FiberState::Init as u8, Ordering::Release);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // A thread-main fiber is Exec for its whole life and is
        // dropped from TLS at thread exit; only stackful fibers must
        // not die mid-run.
        let stack = unsafe { (*self.stack.get()).take() };
        debug_assert!(
            self.state() != FiberState::Exec || stack.is_none(),
            "fiber {} dropped while executing",
            self.id
        );
        if let Some(stack) = stack {
            memory::release_stack(stack);
        }
        id::fiber_destroyed();
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry point for every fiber, reached through the arch trampoline.
/// Runs the callback, records the terminal state, and switches back to
/// the resumer. Never returns.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let cb = unsafe { (*fiber.cb.get()).take() };
    let terminal = match cb {
        Some(cb) => match panic::catch_unwind(AssertUnwindSafe(cb)) {
            Ok(()) => FiberState::Term,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                kerror!("fiber {} panicked: {}", fiber.id, msg);
                FiberState::Except
            }
        },
        None => {
            kerror!("fiber {} started with no callback", fiber.id);
            FiberState::Except
        }
    };

    fiber.yield_to.store(terminal as u8, Ordering::Release);
    unsafe {
        switch_context(fiber.regs.get(), fiber.link.get());
    }
    unreachable!("terminated fiber {} was resumed", fiber.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fiber_runs_to_term() {
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        let f = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(f.state(), FiberState::Init);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_ready_roundtrip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let f = Fiber::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_ready();
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_ready();
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        f.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_hold_state() {
        let f = Fiber::new(|| {
            Fiber::yield_hold();
        })
        .unwrap();
        f.resume();
        assert_eq!(f.state(), FiberState::Hold);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_fiber() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let f = Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        f.resume();
        assert_eq!(f.state(), FiberState::Term);

        let c = count.clone();
        f.reset(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(f.state(), FiberState::Init);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panic_marks_except() {
        let f = Fiber::new(|| {
            panic!("boom");
        })
        .unwrap();
        f.resume();
        assert_eq!(f.state(), FiberState::Except);
        // An Except fiber can be rearmed like a Term one.
        let ok = Arc::new(AtomicUsize::new(0));
        let o = ok.clone();
        f.reset(move || {
            o.fetch_add(1, Ordering::SeqCst);
        });
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_current_on_plain_thread_is_main() {
        std::thread::spawn(|| {
            let main = Fiber::current();
            assert_eq!(main.state(), FiberState::Exec);
            assert_eq!(Fiber::current().id(), main.id());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_main_fiber_dropped_cleanly_at_thread_exit() {
        // The main fiber stays Exec forever and is torn down from TLS
        // when its thread ends; that teardown must not trip the
        // mid-run drop check.
        let joined = std::thread::spawn(|| {
            let main = Fiber::current();
            assert_eq!(main.state(), FiberState::Exec);
        })
        .join();
        assert!(joined.is_ok());
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let f = Fiber::new(move || {
            // current() inside the fiber must be the fiber itself.
            let me = Fiber::current();
            s.store(me.id().as_u64() as usize, Ordering::SeqCst);
        })
        .unwrap();
        let id = f.id();
        f.resume();
        assert_eq!(seen.load(Ordering::SeqCst), id.as_u64() as usize);
    }
}
