//! Wall-clock timers.
//!
//! Timers live in an ordered set keyed by (deadline, sequence), so the
//! earliest deadline is always the first entry and equal deadlines
//! stay distinct. The owner (typically the reactor) polls
//! [`TimerManager::next_timer_ms`] to size its wait, then drains
//! [`TimerManager::take_expired`] and runs the callbacks itself;
//! nothing here spawns threads or runs user code.
//!
//! Deadlines are wall-clock milliseconds. A large backwards jump of
//! the system clock (over an hour) is treated as a rollover and fires
//! everything rather than stalling timers for the skipped span.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use weft_core::kdebug;

/// Backwards clock jump beyond this is a rollover.
const ROLLOVER_SLACK_MS: u64 = 60 * 60 * 1000;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct Timer {
    seq: u64,
    /// Interval for recurring timers, initial delay otherwise.
    /// Atomic so reset() can change the cadence in place.
    period_ms: AtomicU64,
    recurring: bool,
    /// Absolute deadline; rewritten on refresh/reset/re-arm.
    next_ms: AtomicU64,
    /// None once cancelled or (for one-shot) fired.
    cb: Mutex<Option<TimerCallback>>,
    mgr: Weak<TimerManager>,
}

impl Timer {
    #[inline]
    fn key(&self) -> (u64, u64) {
        (self.next_ms.load(Ordering::Acquire), self.seq)
    }

    /// Remove the timer from its manager and drop the callback. A
    /// cancelled timer never fires again; cancelling twice is a no-op.
    pub fn cancel(&self) {
        let had_cb = self.cb.lock().unwrap().take().is_some();
        if !had_cb {
            return;
        }
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.timers.write().unwrap().remove(&self.key());
        }
    }

    /// Push the deadline out by a full period from now. No-op if the
    /// timer is cancelled or already fired.
    pub fn refresh(&self) {
        let Some(mgr) = self.mgr.upgrade() else { return };
        let mut timers = mgr.timers.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return;
        }
        let Some(this) = timers.remove(&self.key()) else {
            return;
        };
        let period = self.period_ms.load(Ordering::Acquire);
        self.next_ms.store(now_ms() + period, Ordering::Release);
        timers.insert(self.key(), this);
    }

    /// Change the period. With `from_now` the new deadline counts from
    /// the current time, otherwise from the old deadline's start.
    /// Returns false if the timer is no longer armed.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let old_period = self.period_ms.load(Ordering::Acquire);
        if period_ms == old_period && !from_now {
            return true;
        }
        let front_changed;
        {
            let mut timers = mgr.timers.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            let Some(this) = timers.remove(&self.key()) else {
                return false;
            };
            let start = if from_now {
                now_ms()
            } else {
                self.next_ms
                    .load(Ordering::Acquire)
                    .saturating_sub(old_period)
            };
            self.period_ms.store(period_ms, Ordering::Release);
            self.next_ms.store(start + period_ms, Ordering::Release);
            timers.insert(self.key(), this);
            front_changed = timers.keys().next() == Some(&self.key());
        }
        if front_changed {
            mgr.notify_front_change();
        }
        true
    }
}

/// Ordered timer set, usually embedded in a reactor.
pub struct TimerManager {
    timers: RwLock<BTreeMap<(u64, u64), Arc<Timer>>>,
    /// Last wall clock seen by the expiry scan, for rollover detection.
    previous_now: AtomicU64,
    /// Called when a new earliest deadline appears, so a sleeping
    /// owner can re-evaluate its wait. Installed once by the owner.
    front_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            timers: RwLock::new(BTreeMap::new()),
            previous_now: AtomicU64::new(now_ms()),
            front_hook: RwLock::new(None),
        })
    }

    /// Install the front-of-set change hook. The hook must be cheap
    /// and signal-safe in spirit; the reactor writes one pipe byte.
    pub fn set_front_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.front_hook.write().unwrap() = Some(Box::new(hook));
    }

    fn notify_front_change(&self) {
        if let Some(hook) = self.front_hook.read().unwrap().as_ref() {
            hook();
        }
    }

    /// Arm a timer `period_ms` from now. Recurring timers re-arm
    /// themselves every period until cancelled.
    pub fn add_timer(
        self: &Arc<Self>,
        period_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            seq: NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            period_ms: AtomicU64::new(period_ms),
            recurring,
            next_ms: AtomicU64::new(now_ms() + period_ms),
            cb: Mutex::new(Some(Arc::new(cb))),
            mgr: Arc::downgrade(self),
        });
        self.insert(timer.clone());
        timer
    }

    /// Arm a timer whose callback only runs while `cond` is alive.
    /// When the watched value is dropped the expiry is silently
    /// swallowed, which doubles as a cancellation path.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        period_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer(
            period_ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn insert(&self, timer: Arc<Timer>) {
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            let key = timer.key();
            timers.insert(key, timer);
            timers.keys().next() == Some(&key)
        };
        if at_front {
            kdebug!("timer set has a new earliest deadline");
            self.notify_front_change();
        }
    }

    /// Milliseconds until the earliest deadline. `Some(0)` when a
    /// timer is already due, `None` when the set is empty.
    pub fn next_timer_ms(&self) -> Option<u64> {
        let timers = self.timers.read().unwrap();
        let (&(next, _), _) = timers.iter().next()?;
        Some(next.saturating_sub(now_ms()))
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Detach and return the callbacks of every expired timer.
    /// Recurring timers are re-armed one period ahead before their
    /// callback is handed out.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        self.take_expired_at(now_ms())
    }

    fn detect_rollover(&self, now: u64) -> bool {
        let prev = self.previous_now.swap(now, Ordering::AcqRel);
        now < prev.saturating_sub(ROLLOVER_SLACK_MS)
    }

    pub(crate) fn take_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        let rollover = self.detect_rollover(now);
        let mut expired = Vec::new();
        let mut requeue = Vec::new();
        {
            let mut timers = self.timers.write().unwrap();
            if timers.is_empty() {
                return expired;
            }
            while let Some((&key, _)) = timers.iter().next() {
                if !rollover && key.0 > now {
                    break;
                }
                let timer = timers.remove(&key).unwrap();
                let cb = if timer.recurring {
                    timer.cb.lock().unwrap().clone()
                } else {
                    timer.cb.lock().unwrap().take()
                };
                let Some(cb) = cb else { continue };
                expired.push(cb);
                if timer.recurring {
                    let period = timer.period_ms.load(Ordering::Acquire);
                    timer.next_ms.store(now + period, Ordering::Release);
                    requeue.push(timer);
                }
            }
            for timer in requeue {
                // A cancel may have taken the callback since it was
                // cloned above; a re-armed timer that can never fire
                // would hold has_timers() true for a whole period.
                if timer.cb.lock().unwrap().is_none() {
                    continue;
                }
                let key = timer.key();
                timers.insert(key, timer);
            }
        }
        if !expired.is_empty() {
            kdebug!("{} timer(s) expired", expired.len());
        }
        expired
    }
}
