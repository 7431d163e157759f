//! weft: a cooperative fiber runtime.
//!
//! Fibers are stackful coroutines multiplexed over a pool of worker
//! threads. A reactor worker pool also owns an epoll instance and a
//! timer set, so fibers can park on fd readiness or a deadline and be
//! rescheduled when it arrives.
//!
//! ```no_run
//! use weft::Runtime;
//!
//! let rt = Runtime::new(2, "app").unwrap();
//! rt.spawn(|| {
//!     weft::sleep_ms(100);
//!     println!("tick");
//! });
//! rt.block_on(|| 40 + 2);
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

pub use weft_core::env;
pub use weft_core::error::{SchedError, SchedResult};
pub use weft_core::kprint::{set_log_level, LogLevel};
pub use weft_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};
pub use weft_core::id::FiberId;
pub use weft_core::state::FiberState;
pub use weft_runtime::config::RuntimeConfig;
pub use weft_runtime::fiber::Fiber;
pub use weft_runtime::reactor::{IoEvent, IoManager};
pub use weft_runtime::scheduler::{Idler, Scheduler};
pub use weft_runtime::timer::{Timer, TimerManager};

/// Started reactor pool with scoped shutdown.
///
/// `new` brings the workers up; dropping the runtime stops them,
/// waiting for queued work, armed timers, and registered fd events to
/// resolve first.
pub struct Runtime {
    io: Arc<IoManager>,
}

impl Runtime {
    /// Start a reactor-backed pool of `threads` workers (0 picks the
    /// configured default).
    pub fn new(threads: usize, name: &str) -> SchedResult<Runtime> {
        let io = IoManager::new(threads, false, name)?;
        io.start()?;
        Ok(Runtime { io })
    }

    /// The underlying reactor, for fd event registration and timers.
    #[inline]
    pub fn io(&self) -> &Arc<IoManager> {
        &self.io
    }

    /// Queue a callback to run as a fiber on some worker.
    pub fn spawn(&self, cb: impl FnOnce() + Send + 'static) {
        self.io.schedule(cb);
    }

    /// Run `f` on a worker fiber and block the calling thread until it
    /// finishes, returning its result.
    pub fn block_on<T: Send + 'static>(&self, f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        self.io.schedule(move || {
            // If f panics the sender is dropped and recv errors out.
            let _ = tx.send(f());
        });
        rx.recv().expect("block_on fiber panicked")
    }

    /// Stop the pool, draining outstanding work. Idempotent; also runs
    /// on drop.
    pub fn shutdown(&self) -> SchedResult<()> {
        self.io.stop()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.io.stop();
    }
}

/// Queue a callback on the scheduler owning the current worker.
///
/// Panics off-pool; use [`Runtime::spawn`] from foreign threads.
pub fn spawn(cb: impl FnOnce() + Send + 'static) {
    Scheduler::current()
        .expect("weft::spawn called outside a worker")
        .schedule(cb);
}

/// Let other fibers run; the current fiber goes back in the queue.
pub fn yield_now() {
    Fiber::yield_ready();
}

/// Park the current fiber for at least `ms` milliseconds.
///
/// On a reactor worker this arms a timer and yields, blocking nothing.
/// On a foreign thread it degrades to `thread::sleep`.
pub fn sleep_ms(ms: u64) {
    let Some(io) = IoManager::current() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let sched = io.clone();
    io.timers().add_timer(
        ms,
        move || {
            sched.schedule_fiber(fiber.clone());
        },
        false,
    );
    Fiber::yield_hold();
}
