//! Fiber lifecycle state machine

use core::fmt;

/// State of a fiber
///
/// A fiber moves through these states under the control of exactly one
/// dispatcher at a time; at most one OS thread ever executes a fiber's
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Context is armed for its callback but has never run
    Init = 0,

    /// Runnable, waiting for a worker to resume it
    Ready = 1,

    /// Currently executing on a worker
    Exec = 2,

    /// Parked, waiting for an external wake (timer, fd readiness, ...)
    Hold = 3,

    /// Callback returned normally; reusable only via reset()
    Term = 4,

    /// Callback panicked; reusable only via reset()
    Except = 5,
}

impl FiberState {
    /// Can a dispatcher resume a fiber in this state?
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }

    /// Has this fiber finished (normally or via a fault)?
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// May reset() re-arm a fiber in this state?
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => FiberState::Init, // Default for invalid values
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Init => write!(f, "INIT"),
            FiberState::Ready => write!(f, "READY"),
            FiberState::Exec => write!(f, "EXEC"),
            FiberState::Hold => write!(f, "HOLD"),
            FiberState::Term => write!(f, "TERM"),
            FiberState::Except => write!(f, "EXCEPT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable() {
        assert!(FiberState::Init.is_resumable());
        assert!(FiberState::Ready.is_resumable());
        assert!(FiberState::Hold.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Term.is_resumable());
        assert!(!FiberState::Except.is_resumable());
    }

    #[test]
    fn test_terminated() {
        assert!(FiberState::Term.is_terminated());
        assert!(FiberState::Except.is_terminated());
        assert!(!FiberState::Hold.is_terminated());
    }

    #[test]
    fn test_resettable() {
        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Term.is_resettable());
        assert!(FiberState::Except.is_resettable());
        assert!(!FiberState::Exec.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
        assert!(!FiberState::Hold.is_resettable());
    }

    #[test]
    fn test_u8_round_trip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }
}
