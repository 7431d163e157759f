//! Epoll reactor layered on the scheduler.
//!
//! [`IoManager`] is a [`Scheduler`] whose idle behavior blocks in
//! `epoll_wait` instead of a condvar. Fibers register interest in fd
//! readiness through [`add_event`]; when the kernel reports the event
//! the parked fiber (or callback) is pushed onto the run queue, never
//! run inline on the reactor's stack. A [`TimerManager`] shares the
//! same wait: the epoll timeout is clamped to the next deadline and
//! expired callbacks are scheduled each round.
//!
//! Wakeups use a self-pipe. The read end sits in the epoll set
//! level-triggered, so a byte written while no worker is waiting still
//! ends the next wait, and one byte can rouse several workers during
//! shutdown. Ordinary fd registrations are edge-triggered.
//!
//! [`add_event`]: IoManager::add_event

use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use weft_core::error::{SchedError, SchedResult};
use weft_core::{kdebug, ktrace, kwarn};

use crate::fiber::Fiber;
use crate::scheduler::{Idler, Scheduler};
use crate::timer::{TimerManager, now_ms};
use crate::{config, tls};

/// One epoll interest. Values match the kernel's EPOLLIN/EPOLLOUT so
/// masks convert without translation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoEvent {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
}

impl std::fmt::Display for IoEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoEvent::Read => write!(f, "READ"),
            IoEvent::Write => write!(f, "WRITE"),
        }
    }
}

/// What to do when an event fires: resume a parked fiber or run a
/// callback on some worker.
enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct FdSlots {
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdSlots {
    fn slot(&mut self, event: IoEvent) -> &mut Option<Waiter> {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }

    /// Epoll interest mask implied by the occupied slots.
    fn mask(&self) -> u32 {
        let mut m = 0;
        if self.read.is_some() {
            m |= IoEvent::Read as u32;
        }
        if self.write.is_some() {
            m |= IoEvent::Write as u32;
        }
        m
    }
}

/// Per-fd registration state. The epoll interest mask is always
/// derived from which slots are occupied; there is no separately
/// tracked mask to drift out of sync.
struct FdContext {
    fd: RawFd,
    slots: Mutex<FdSlots>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            slots: Mutex::new(FdSlots::default()),
        }
    }
}

pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,

    epoll_fd: RawFd,
    /// Self-pipe; [0] read end in the epoll set, [1] write end for
    /// tickles and the timer front hook.
    tickle_fds: [RawFd; 2],

    /// Registered, not-yet-fired event slots across all fds.
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl IoManager {
    /// Build a reactor-backed scheduler. Workers do not run until
    /// [`start`](Scheduler::start) is called through [`start`].
    ///
    /// [`start`]: IoManager::start
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<IoManager>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(SchedError::ReactorSetup(errno()));
        }

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            let err = errno();
            unsafe { libc::close(epoll_fd) };
            return Err(SchedError::ReactorSetup(err));
        }

        // Tickle pipe is level-triggered on purpose: an undrained byte
        // keeps ending waits until someone drains it, so wakeups are
        // never lost to a race with epoll_wait entry.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fds[0] as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) };
        if rc != 0 {
            let err = errno();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
                libc::close(epoll_fd);
            }
            return Err(SchedError::ReactorSetup(err));
        }

        let sched = Scheduler::new(threads, use_caller, name);
        let timers = TimerManager::new();

        let io = Arc::new(IoManager {
            sched: sched.clone(),
            timers: timers.clone(),
            epoll_fd,
            tickle_fds: fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
        });

        // A new earliest deadline must shorten a wait already in
        // progress. The hook owns only the raw write fd, so the timer
        // set never holds the reactor alive.
        let wake_fd = fds[1];
        timers.set_front_hook(move || {
            let byte = [b'T'];
            unsafe {
                libc::write(wake_fd, byte.as_ptr() as *const libc::c_void, 1);
            }
        });

        sched.set_idler(io.clone());
        Ok(io)
    }

    /// The reactor the calling worker belongs to, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        tls::reactor()
    }

    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        self.sched.start()
    }

    /// Stop the underlying scheduler. Returns once every worker has
    /// drained: queued tasks run, armed timers fire, registered events
    /// resolve. A recurring timer must be cancelled first or shutdown
    /// will wait on it forever.
    pub fn stop(self: &Arc<Self>) -> SchedResult<()> {
        self.sched.stop()
    }

    #[inline]
    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read().unwrap();
            if let Some(Some(ctx)) = table.get(idx) {
                return ctx.clone();
            }
        }
        let mut table = self.fd_contexts.write().unwrap();
        if table.len() <= idx {
            table.resize_with((idx + 1).max(64).next_power_of_two(), || None);
        }
        table[idx]
            .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
            .clone()
    }

    /// Register interest in `event` on `fd`.
    ///
    /// With a callback, the callback is scheduled when the event
    /// fires. Without one, the *current fiber* is parked as the
    /// waiter; the caller is expected to `Fiber::yield_hold()` right
    /// after and will be rescheduled on readiness. Events are one-shot
    /// at this layer: a fired event must be re-added.
    ///
    /// Re-arming an already-armed direction replaces the stored
    /// waiter; the displaced one is dropped without being scheduled.
    /// Coordinating registrants is the caller's job, not the
    /// reactor's.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> SchedResult<()> {
        if fd < 0 {
            return Err(SchedError::BadFd(fd));
        }
        let ctx = self.fd_context(fd);
        let mut slots = ctx.slots.lock().unwrap();

        let old_mask = slots.mask();
        let waiter = match cb {
            Some(cb) => Waiter::Callback(cb),
            None => Waiter::Fiber(Fiber::current()),
        };
        let displaced = slots.slot(event).replace(waiter);
        if displaced.is_some() {
            kwarn!("fd {} {} waiter replaced by a newer registration", fd, event);
        }

        if let Err(e) = self.update_epoll(ctx.fd, old_mask, slots.mask()) {
            *slots.slot(event) = None;
            return Err(e);
        }
        if displaced.is_none() {
            self.pending_events.fetch_add(1, Ordering::SeqCst);
        }
        ktrace!("fd {} armed for {}", fd, event);
        Ok(())
    }

    /// Convenience: park the current fiber until `fd` is ready for
    /// `event`.
    pub fn wait_event(&self, fd: RawFd, event: IoEvent) -> SchedResult<()> {
        self.add_event(fd, event, None)?;
        Fiber::yield_hold();
        Ok(())
    }

    /// Remove a registration without waking its waiter. Returns false
    /// when the direction was not armed; the other direction is left
    /// untouched either way.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> SchedResult<bool> {
        let Some(waiter) = self.detach(fd, event)? else {
            return Ok(false);
        };
        drop(waiter);
        Ok(true)
    }

    /// Remove a registration and wake its waiter as if the event had
    /// fired. The woken side cannot tell cancellation from readiness
    /// and must recheck the fd. Returns false when nothing was armed.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> SchedResult<bool> {
        if let Some(waiter) = self.detach(fd, event)? {
            self.dispatch(waiter);
            return Ok(true);
        }
        Ok(false)
    }

    /// Cancel both directions on `fd`, waking every waiter.
    pub fn cancel_all(&self, fd: RawFd) -> SchedResult<()> {
        for event in [IoEvent::Read, IoEvent::Write] {
            self.cancel_event(fd, event)?;
        }
        Ok(())
    }

    /// Take one waiter off an fd and shrink the epoll interest to the
    /// remaining slots.
    fn detach(&self, fd: RawFd, event: IoEvent) -> SchedResult<Option<Waiter>> {
        if fd < 0 {
            return Err(SchedError::BadFd(fd));
        }
        let ctx = {
            let table = self.fd_contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(Some(ctx)) => ctx.clone(),
                _ => return Ok(None),
            }
        };
        let mut slots = ctx.slots.lock().unwrap();
        let Some(waiter) = slots.slot(event).take() else {
            return Ok(None);
        };
        let new_mask = slots.mask();
        // The fd may already be closed by the time an event is
        // cancelled; a failed shrink only matters if a mask remains.
        if let Err(e) = self.update_epoll(ctx.fd, new_mask | event as u32, new_mask) {
            if new_mask != 0 {
                kwarn!("epoll shrink failed for fd {}: {}", fd, e);
            }
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(waiter))
    }

    /// Push a woken waiter onto the run queue. Never runs it inline:
    /// user code does not execute on the reactor's dispatch stack.
    fn dispatch(&self, waiter: Waiter) {
        match waiter {
            Waiter::Fiber(fiber) => self.sched.schedule_fiber(fiber),
            Waiter::Callback(cb) => self.sched.schedule(cb),
        }
    }

    /// Apply an interest mask change for `fd`, choosing ADD, MOD or
    /// DEL from the old and new masks. Real fds are edge-triggered.
    fn update_epoll(&self, fd: RawFd, old_mask: u32, new_mask: u32) -> SchedResult<()> {
        let op = match (old_mask, new_mask) {
            (0, 0) => return Ok(()),
            (0, _) => libc::EPOLL_CTL_ADD,
            (_, 0) => libc::EPOLL_CTL_DEL,
            _ if old_mask == new_mask => return Ok(()),
            _ => libc::EPOLL_CTL_MOD,
        };
        let mut ev = libc::epoll_event {
            events: new_mask | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(SchedError::EpollCtl(errno()));
        }
        Ok(())
    }

    /// Kernel reported `ready_mask` for `fd`: wake the matching
    /// waiters. Error and hangup conditions wake everything armed on
    /// the fd so nobody sleeps through a dead socket.
    fn handle_ready(&self, fd: RawFd, ready_mask: u32) {
        let err_mask = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        let effective = if ready_mask & err_mask != 0 {
            ready_mask | IoEvent::Read as u32 | IoEvent::Write as u32
        } else {
            ready_mask
        };
        for event in [IoEvent::Read, IoEvent::Write] {
            if effective & event as u32 == 0 {
                continue;
            }
            match self.detach(fd, event) {
                Ok(Some(waiter)) => self.dispatch(waiter),
                Ok(None) => {}
                Err(e) => kwarn!("detach on ready fd {} failed: {}", fd, e),
            }
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn write_tickle(&self) {
        let byte = [b'W'];
        let rc = unsafe {
            libc::write(
                self.tickle_fds[1],
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        // A full pipe already guarantees pending wakeups.
        let _ = rc;
    }

    /// One epoll round: wait (bounded by the next timer deadline),
    /// service readiness, schedule expired timers.
    fn poll_once(&self) {
        const MAX_EVENTS: usize = 256;
        let cap = config::runtime().max_epoll_timeout_ms;
        let timeout_ms = match self.timers.next_timer_ms() {
            Some(next) => next.min(cap),
            None => cap,
        } as libc::c_int;

        let mut events: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            if errno() != libc::EINTR {
                kwarn!("epoll_wait failed: errno {}", errno());
            }
            return;
        }

        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            if fd == self.tickle_fds[0] {
                self.drain_tickle_pipe();
                continue;
            }
            self.handle_ready(fd, ev.events);
        }

        let expired = self.timers.take_expired();
        if !expired.is_empty() {
            kdebug!("scheduling {} expired timer(s) at {}", expired.len(), now_ms());
            for cb in expired {
                self.sched.schedule(move || cb());
            }
        }
    }
}

impl Idler for IoManager {
    fn tickle(&self) {
        self.write_tickle();
    }

    fn tickle_all(&self) {
        // Level-triggered read end: one unread byte keeps waking
        // workers until each has seen it or it is drained.
        self.write_tickle();
    }

    fn idle(self: Arc<Self>) {
        loop {
            if self.sched.stopping() {
                return;
            }
            self.poll_once();
            Fiber::yield_hold();
        }
    }

    fn can_stop(&self) -> bool {
        self.pending_events.load(Ordering::SeqCst) == 0 && !self.timers.has_timers()
    }

    fn on_worker_start(self: Arc<Self>) {
        tls::set_reactor(Some(self));
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fds[1]);
            libc::close(self.tickle_fds[0]);
            libc::close(self.epoll_fd);
        }
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(pred: impl Fn() -> bool, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        pred()
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_pair(r: RawFd, w: RawFd) {
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_read_event_wakes_parked_fiber() {
        let io = IoManager::new(2, false, "t-io-read").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        let phase = Arc::new(AtomicUsize::new(0));

        let p = phase.clone();
        let io2 = io.clone();
        io.schedule(move || {
            p.store(1, Ordering::SeqCst);
            io2.wait_event(r, IoEvent::Read).unwrap();
            // Back here only after the pipe became readable.
            let mut b = [0u8; 8];
            let n = unsafe { libc::read(r, b.as_mut_ptr() as *mut libc::c_void, 8) };
            assert!(n > 0);
            p.store(2, Ordering::SeqCst);
        });

        assert!(wait_until(|| phase.load(Ordering::SeqCst) == 1, 5000));
        // Give the fiber time to park, then make the fd readable.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(phase.load(Ordering::SeqCst), 1);
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert!(wait_until(|| phase.load(Ordering::SeqCst) == 2, 5000));

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_callback_event_fires_on_readiness() {
        let io = IoManager::new(1, false, "t-io-cb").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        io.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(io.pending_events(), 1);

        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1, 5000));
        assert_eq!(io.pending_events(), 0);

        // The direction is unarmed after firing; more readiness does
        // not re-invoke the callback without a fresh add_event.
        unsafe { libc::write(w, b"y".as_ptr() as *const libc::c_void, 1) };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_second_registration_replaces_first() {
        let io = IoManager::new(1, false, "t-io-replace").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        io.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        // Last registrant wins; the displaced waiter is dropped
        // silently and the pending count stays at one.
        let s = second.clone();
        io.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(io.pending_events(), 1);

        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert!(wait_until(|| second.load(Ordering::SeqCst) == 1, 5000));
        assert_eq!(first.load(Ordering::SeqCst), 0);

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_del_event_on_unarmed_direction() {
        let io = IoManager::new(1, false, "t-io-notfound").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        assert!(!io.del_event(r, IoEvent::Read).unwrap());
        assert!(!io.cancel_event(r, IoEvent::Read).unwrap());

        // Removing a missing READ must not disturb an armed WRITE.
        io.add_event(r, IoEvent::Write, Some(Box::new(|| {}))).unwrap();
        assert!(!io.del_event(r, IoEvent::Read).unwrap());
        assert_eq!(io.pending_events(), 1);
        assert!(io.del_event(r, IoEvent::Write).unwrap());
        assert_eq!(io.pending_events(), 0);

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_cancel_event_wakes_without_readiness() {
        let io = IoManager::new(1, false, "t-io-cancel").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        io.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        // No data written; cancellation alone must deliver the wake.
        io.cancel_event(r, IoEvent::Read).unwrap();
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1, 5000));
        assert_eq!(io.pending_events(), 0);

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_cancel_event_resumes_parked_fiber() {
        let io = IoManager::new(2, false, "t-io-cancel-fiber").unwrap();
        io.start().unwrap();

        // A pipe's read end never becomes writable, so the fiber can
        // only come back through cancellation.
        let (r, w) = make_pipe();
        let phase = Arc::new(AtomicUsize::new(0));

        let p = phase.clone();
        let io2 = io.clone();
        io.schedule(move || {
            p.store(1, Ordering::SeqCst);
            io2.wait_event(r, IoEvent::Write).unwrap();
            p.store(2, Ordering::SeqCst);
        });

        assert!(wait_until(|| phase.load(Ordering::SeqCst) == 1, 5000));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(phase.load(Ordering::SeqCst), 1);

        assert!(io.cancel_event(r, IoEvent::Write).unwrap());
        assert!(wait_until(|| phase.load(Ordering::SeqCst) == 2, 5000));
        assert_eq!(io.pending_events(), 0);

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_del_event_discards_silently() {
        let io = IoManager::new(1, false, "t-io-del").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        io.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        io.del_event(r, IoEvent::Read).unwrap();

        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(io.pending_events(), 0);

        io.stop().unwrap();
        close_pair(r, w);
    }

    #[test]
    fn test_timer_wakes_sleeping_reactor() {
        let io = IoManager::new(1, false, "t-io-timer").unwrap();
        io.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let start = Instant::now();
        io.timers().add_timer(
            30,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1, 5000));
        // Must fire near the deadline, not at the epoll timeout cap.
        assert!(start.elapsed() < Duration::from_millis(1000));

        io.stop().unwrap();
    }

    #[test]
    fn test_stop_waits_for_pending_event() {
        let io = IoManager::new(1, false, "t-io-stopwait").unwrap();
        io.start().unwrap();

        let (r, w) = make_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        io.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        // Resolve the event shortly after stop is requested.
        let stopper = {
            let io = io.clone();
            thread::spawn(move || io.stop())
        };
        thread::sleep(Duration::from_millis(30));
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        stopper.join().unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        close_pair(r, w);
    }
}
