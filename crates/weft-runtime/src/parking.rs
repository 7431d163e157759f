//! Worker parking.
//!
//! Condvar-based blocking for workers with nothing to run. A wake that
//! arrives before the park is remembered in the flag and consumed by
//! the next park, so notifications are never lost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Parker {
    /// wake_pending flag under the condvar mutex.
    mutex: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Block until woken or the timeout elapses. Returns true when a
    /// wake was received.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        let mut guard = self.mutex.lock().unwrap();

        if *guard {
            *guard = false;
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        let result = match timeout {
            Some(t) => {
                let (g, timeout_result) = self.condvar.wait_timeout(guard, t).unwrap();
                guard = g;
                !timeout_result.timed_out()
            }
            None => {
                guard = self.condvar.wait(guard).unwrap();
                true
            }
        };

        if *guard {
            *guard = false;
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Wake one parked worker. The flag is set even when nobody is
    /// parked yet, so a racing park-in-progress still sees it.
    pub fn wake_one(&self) {
        {
            let mut guard = self.mutex.lock().unwrap();
            *guard = true;
        }
        self.condvar.notify_one();
    }

    /// Wake every parked worker.
    pub fn wake_all(&self) {
        {
            let mut guard = self.mutex.lock().unwrap();
            *guard = true;
        }
        self.condvar.notify_all();
    }

    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_park_times_out() {
        let p = Parker::new();
        let start = Instant::now();
        let woken = p.park(Some(Duration::from_millis(20)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(p.parked_count(), 0);
    }

    #[test]
    fn test_wake_before_park_is_consumed() {
        let p = Parker::new();
        p.wake_one();
        // Must return immediately without waiting out the timeout.
        let start = Instant::now();
        assert!(p.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_releases_parked_thread() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let h = std::thread::spawn(move || p2.park(Some(Duration::from_secs(5))));
        while p.parked_count() == 0 {
            std::thread::yield_now();
        }
        p.wake_one();
        assert!(h.join().unwrap());
    }
}
