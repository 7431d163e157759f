//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
///
/// These cover the *recoverable* failures: syscall rejections and
/// lifecycle misuse a caller can react to. Invariant violations
/// (resuming an EXEC fiber, stack allocation failure) are fatal and
/// assert instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler has not been started
    NotStarted,

    /// Scheduler is already running
    AlreadyStarted,

    /// File descriptor is negative or otherwise unusable
    BadFd(i32),

    /// epoll_ctl rejected the operation (errno attached)
    EpollCtl(i32),

    /// epoll_create/pipe setup failed (errno attached)
    ReactorSetup(i32),

    /// Memory allocation/mapping failed
    MemoryError(MemoryError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotStarted => write!(f, "scheduler not started"),
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::BadFd(fd) => write!(f, "bad file descriptor: {}", fd),
            SchedError::EpollCtl(errno) => write!(f, "epoll_ctl failed: errno {}", errno),
            SchedError::ReactorSetup(errno) => write!(f, "reactor setup failed: errno {}", errno),
            SchedError::MemoryError(e) => write!(f, "memory error: {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed (guard page)
    ProtectionFailed,

    /// Requested stack size is not usable
    BadStackSize(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::BadStackSize(sz) => write!(f, "bad stack size: {}", sz),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::MemoryError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::NotStarted;
        assert_eq!(format!("{}", e), "scheduler not started");

        let e = SchedError::EpollCtl(9);
        assert_eq!(format!("{}", e), "epoll_ctl failed: errno 9");

        let e = SchedError::MemoryError(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: stack allocation failed");
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::ProtectionFailed;
        let sched_err: SchedError = mem_err.into();
        assert!(matches!(
            sched_err,
            SchedError::MemoryError(MemoryError::ProtectionFailed)
        ));
    }
}
