//! N worker threads dispatching M fibers.
//!
//! The scheduler owns a shared run queue of [`Task`]s. Tasks carry
//! either a prepared fiber or a bare callback; callbacks are run on a
//! reusable per-worker fiber so a stream of small jobs does not churn
//! stack allocations. A task may be pinned to one worker, in which
//! case other workers skip it and prod the pool so the target notices.
//!
//! Workers with nothing to run resume an idle fiber whose behavior
//! comes from the attached [`Idler`]: the plain scheduler parks on a
//! condvar, an [`IoManager`](crate::reactor::IoManager) blocks in
//! epoll_wait. The idle fiber yields Hold between rounds and
//! terminates once the scheduler is fully stopped, which is the
//! worker's signal to exit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use weft_core::error::{SchedError, SchedResult};
use weft_core::{kdebug, kinfo, kwarn};

use crate::config;
use crate::fiber::Fiber;
use crate::parking::Parker;
use crate::tls;

/// Unit of scheduling: a fiber or a callback, optionally pinned to
/// one worker.
pub(crate) struct Task {
    pub fiber: Option<Arc<Fiber>>,
    pub cb: Option<Box<dyn FnOnce() + Send>>,
    pub pin: Option<usize>,
}

impl Task {
    fn from_cb(cb: Box<dyn FnOnce() + Send>, pin: Option<usize>) -> Task {
        Task {
            fiber: None,
            cb: Some(cb),
            pin,
        }
    }

    fn from_fiber(fiber: Arc<Fiber>, pin: Option<usize>) -> Task {
        Task {
            fiber: Some(fiber),
            cb: None,
            pin,
        }
    }
}

/// Pluggable idle behavior for a scheduler's workers.
///
/// `idle` runs inside each worker's idle fiber: it should block until
/// work may exist, yield Hold, and repeat until the owning scheduler
/// reports `stopping()`. Returning terminates the idle fiber and with
/// it the worker.
pub trait Idler: Send + Sync {
    /// Wake one blocked worker.
    fn tickle(&self);

    /// Wake every blocked worker.
    fn tickle_all(&self);

    /// Body of the idle fiber; see trait docs.
    fn idle(self: Arc<Self>);

    /// Any outstanding reasons to keep running? Consulted by
    /// `Scheduler::stopping` on top of its own queue/activity checks.
    fn can_stop(&self) -> bool;

    /// Per-worker hook, called on the worker thread before dispatch.
    fn on_worker_start(self: Arc<Self>) {}
}

pub struct Scheduler {
    name: String,
    threads: usize,
    use_caller: bool,

    queue: Mutex<VecDeque<Task>>,
    idler: RwLock<Option<Arc<dyn Idler>>>,

    started: AtomicBool,
    stop_requested: AtomicBool,
    /// Workers currently executing a task.
    active: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idling: AtomicUsize,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers in total.
    ///
    /// With `use_caller`, the thread that later calls [`stop`] serves
    /// as the last worker (id `threads - 1`) and only `threads - 1`
    /// OS threads are spawned.
    ///
    /// [`stop`]: Scheduler::stop
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let threads = if threads == 0 {
            config::runtime().num_workers
        } else {
            threads
        };
        assert!(
            !use_caller || threads >= 1,
            "use_caller needs at least one worker"
        );
        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            threads,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            idler: RwLock::new(None),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idling: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        });
        let idler = Arc::new(ParkIdler::new(&sched));
        *sched.idler.write().unwrap() = Some(idler);
        sched
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.threads
    }

    /// Workers currently executing a task.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers currently inside their idle fiber.
    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idling.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the run queue.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// The scheduler the calling thread works for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    /// Replace the idle behavior. Must happen before [`start`].
    ///
    /// [`start`]: Scheduler::start
    pub fn set_idler(&self, idler: Arc<dyn Idler>) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "set_idler after start"
        );
        *self.idler.write().unwrap() = Some(idler);
    }

    fn idler(&self) -> Option<Arc<dyn Idler>> {
        self.idler.read().unwrap().clone()
    }

    /// Spawn the worker threads.
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        let spawn_count = if self.use_caller {
            self.threads - 1
        } else {
            self.threads
        };
        kinfo!(
            "scheduler '{}' starting, {} workers{}",
            self.name,
            self.threads,
            if self.use_caller { " (incl. caller)" } else { "" }
        );
        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..spawn_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, worker_id))
                .spawn(move || sched.run(worker_id))
                .expect("worker thread spawn failed");
            handles.push(handle);
        }
        Ok(())
    }

    /// Request shutdown and wait for every worker to drain and exit.
    ///
    /// With `use_caller` the calling thread first works off the queue
    /// itself as the last worker. Idempotent after the first call.
    pub fn stop(self: &Arc<Self>) -> SchedResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(SchedError::NotStarted);
        }
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        kinfo!("scheduler '{}' stopping", self.name);
        if let Some(idler) = self.idler() {
            idler.tickle_all();
        }

        if self.use_caller {
            self.run(self.threads - 1);
        }

        let handles = {
            let mut guard = self.handles.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if handle.join().is_err() {
                kwarn!("scheduler '{}' worker panicked", self.name);
            }
        }

        // Drop the idler so a reactor holding this scheduler does not
        // keep the Arc cycle alive.
        *self.idler.write().unwrap() = None;
        kinfo!("scheduler '{}' stopped", self.name);
        Ok(())
    }

    /// True once stop was requested and nothing is left to run.
    pub fn stopping(&self) -> bool {
        if !self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        if self.active.load(Ordering::SeqCst) != 0 {
            return false;
        }
        if !self.queue.lock().unwrap().is_empty() {
            return false;
        }
        match self.idler() {
            Some(idler) => idler.can_stop(),
            None => true,
        }
    }

    /// Queue a callback for any worker.
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static) {
        self.push(Task::from_cb(Box::new(cb), None));
    }

    /// Queue a callback for one specific worker.
    pub fn schedule_to(&self, worker_id: usize, cb: impl FnOnce() + Send + 'static) {
        assert!(worker_id < self.threads, "pin to nonexistent worker");
        self.push(Task::from_cb(Box::new(cb), Some(worker_id)));
    }

    /// Queue an existing fiber for any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.push(Task::from_fiber(fiber, None));
    }

    /// Queue an existing fiber for one specific worker.
    pub fn schedule_fiber_to(&self, worker_id: usize, fiber: Arc<Fiber>) {
        assert!(worker_id < self.threads, "pin to nonexistent worker");
        self.push(Task::from_fiber(fiber, Some(worker_id)));
    }

    /// Queue a batch of callbacks under one lock acquisition.
    pub fn schedule_batch<I>(&self, cbs: I)
    where
        I: IntoIterator<Item = Box<dyn FnOnce() + Send>>,
    {
        let was_empty = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            for cb in cbs {
                queue.push_back(Task::from_cb(cb, None));
            }
            was_empty
        };
        if was_empty {
            if let Some(idler) = self.idler() {
                idler.tickle();
            }
        }
    }

    fn push(&self, task: Task) {
        let was_empty = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        // Only an empty-to-nonempty edge can mean every worker is
        // blocked, so only that edge pays for a wakeup.
        if was_empty {
            if let Some(idler) = self.idler() {
                idler.tickle();
            }
        }
    }

    /// Pop the first task this worker may run. Reports whether a task
    /// pinned elsewhere was seen, so the caller can prod the pool.
    fn take_task(&self, worker_id: usize) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock().unwrap();
        let mut saw_foreign = false;
        let mut i = 0;
        while i < queue.len() {
            let task = &queue[i];
            if let Some(pin) = task.pin {
                if pin != worker_id {
                    saw_foreign = true;
                    i += 1;
                    continue;
                }
            }
            // A fiber still marked Exec has yielded but its resumer
            // has not finished saving it. Leave it queued.
            if let Some(fiber) = &task.fiber {
                if fiber.state() == weft_core::state::FiberState::Exec {
                    saw_foreign = true;
                    i += 1;
                    continue;
                }
            }
            return (queue.remove(i), saw_foreign);
        }
        (None, saw_foreign)
    }

    /// Worker dispatch loop. Runs on each spawned thread, and on the
    /// caller thread during `stop` when `use_caller` is set.
    fn run(self: &Arc<Self>, worker_id: usize) {
        tls::set_worker_id(worker_id);
        tls::set_scheduler(Some(self.clone()));
        // Materialize the dispatch context for this thread.
        let _main = Fiber::current();

        let idler = self.idler().expect("scheduler has no idler");
        idler.clone().on_worker_start();

        let idler_for_idle = idler.clone();
        let idle_fiber = Fiber::new(move || idler_for_idle.idle())
            .expect("idle fiber allocation failed");

        // Reusable fiber for bare-callback tasks.
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        kdebug!("worker {}/{} up", self.name, worker_id);
        loop {
            let (task, saw_foreign) = self.take_task(worker_id);
            if saw_foreign {
                idler.tickle();
            }

            if let Some(task) = task {
                self.active.fetch_add(1, Ordering::SeqCst);
                self.run_task(task, &mut cb_fiber);
                self.active.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            if idle_fiber.state().is_terminated() {
                break;
            }
            self.idling.fetch_add(1, Ordering::SeqCst);
            idle_fiber.resume();
            self.idling.fetch_sub(1, Ordering::SeqCst);
        }
        kdebug!("worker {}/{} exits", self.name, worker_id);

        tls::set_scheduler(None);
        tls::set_reactor(None);
        tls::set_worker_id(usize::MAX);
    }

    fn run_task(&self, task: Task, cb_fiber: &mut Option<Arc<Fiber>>) {
        if let Some(fiber) = task.fiber {
            if fiber.state().is_terminated() {
                return;
            }
            fiber.resume();
            if fiber.state() == weft_core::state::FiberState::Ready {
                self.schedule_fiber(fiber);
            }
            return;
        }

        let Some(cb) = task.cb else { return };
        let fiber = match cb_fiber.take() {
            Some(f) => {
                f.reset(cb);
                f
            }
            None => match Fiber::new(cb) {
                Ok(f) => f,
                Err(e) => {
                    kwarn!("callback fiber allocation failed: {}", e);
                    return;
                }
            },
        };
        fiber.resume();
        match fiber.state() {
            weft_core::state::FiberState::Ready => {
                // The callback rescheduled itself; the fiber now has a
                // life of its own and cannot be recycled.
                self.schedule_fiber(fiber);
            }
            weft_core::state::FiberState::Hold => {
                // Parked waiting for an external wake that holds its
                // own Arc. Not ours to reuse.
            }
            _ => {
                *cb_fiber = Some(fiber);
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("use_caller", &self.use_caller)
            .finish()
    }
}

/// Default idler: park on a condvar with a timeout.
pub struct ParkIdler {
    sched: Weak<Scheduler>,
    parker: Parker,
}

impl ParkIdler {
    pub fn new(sched: &Arc<Scheduler>) -> ParkIdler {
        ParkIdler {
            sched: Arc::downgrade(sched),
            parker: Parker::new(),
        }
    }
}

impl Idler for ParkIdler {
    fn tickle(&self) {
        self.parker.wake_one();
    }

    fn tickle_all(&self) {
        self.parker.wake_all();
    }

    fn idle(self: Arc<Self>) {
        let timeout = Duration::from_millis(config::runtime().park_timeout_ms);
        loop {
            let Some(sched) = self.sched.upgrade() else {
                return;
            };
            if sched.stopping() {
                return;
            }
            drop(sched);
            self.parker.park(Some(timeout));
            Fiber::yield_hold();
        }
    }

    fn can_stop(&self) -> bool {
        true
    }
}
