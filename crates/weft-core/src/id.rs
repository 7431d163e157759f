//! Fiber identifier type and process-wide counters

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber
///
/// Ids are handed out by a process-wide monotonic counter and never
/// reused. Id 0 is reserved as a sentinel for "no fiber".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Create a FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-wide fiber id
#[inline]
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Record a fiber construction (diagnostics counter)
#[inline]
pub fn fiber_created() {
    LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
}

/// Record a fiber destruction (diagnostics counter)
#[inline]
pub fn fiber_destroyed() {
    LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
}

/// Number of fibers currently alive in the process
#[inline]
pub fn live_fibers() -> u64 {
    LIVE_FIBERS.load(Ordering::Relaxed)
}
