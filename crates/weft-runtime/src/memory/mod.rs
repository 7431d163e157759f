//! Fiber stack allocation.
//!
//! Stacks are mmap'd anonymous regions with a PROT_NONE guard page at
//! the low end, so overflow faults instead of scribbling over the
//! neighbouring allocation. Default-size stacks are recycled through a
//! lock-free pool to keep fiber creation off the mmap fast path.

mod unix;

pub use unix::StackBuffer;

use crossbeam_queue::ArrayQueue;
use std::sync::OnceLock;

use weft_core::error::SchedResult;

use crate::config;

/// Recycled default-size stacks. Oversized stacks are always unmapped
/// on release; only the common case is pooled.
static STACK_POOL: OnceLock<ArrayQueue<StackBuffer>> = OnceLock::new();

fn pool() -> &'static ArrayQueue<StackBuffer> {
    STACK_POOL.get_or_init(|| ArrayQueue::new(config::runtime().stack_pool_cap))
}

/// Obtain a stack of at least `size` bytes.
///
/// A pooled stack is reused when `size` is the configured default;
/// anything else goes straight to mmap.
pub fn acquire_stack(size: usize) -> SchedResult<StackBuffer> {
    let default_size = config::runtime().stack_size;
    if size == default_size {
        if let Some(buf) = pool().pop() {
            return Ok(buf);
        }
    }
    StackBuffer::map(size)
}

/// Return a stack for reuse. Non-default sizes are unmapped.
pub fn release_stack(buf: StackBuffer) {
    let default_size = config::runtime().stack_size;
    if buf.size() == default_size {
        // On a full pool the push hands the buffer back and Drop
        // unmaps it.
        let _ = pool().push(buf);
    }
    // Dropped here otherwise; munmap happens in Drop.
}

/// Number of stacks currently parked in the pool. Test hook.
#[allow(dead_code)]
pub fn pooled_stacks() -> usize {
    pool().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let size = config::runtime().stack_size;
        let buf = acquire_stack(size).unwrap();
        assert_eq!(buf.size(), size);
        assert!(!buf.top().is_null());

        let before = pooled_stacks();
        release_stack(buf);
        assert!(pooled_stacks() >= before);

        // Reacquire; with a non-empty pool this must not mmap a new
        // region of a different size.
        let buf2 = acquire_stack(size).unwrap();
        assert_eq!(buf2.size(), size);
        release_stack(buf2);
    }

    #[test]
    fn test_oversized_stack_not_pooled() {
        let size = config::runtime().stack_size * 2;
        let buf = acquire_stack(size).unwrap();
        assert_eq!(buf.size(), size);
        let before = pooled_stacks();
        release_stack(buf);
        assert_eq!(pooled_stacks(), before);
    }

    #[test]
    fn test_stack_is_writable_at_top() {
        let buf = acquire_stack(config::runtime().stack_size).unwrap();
        unsafe {
            // Touch the highest usable bytes; a broken mapping would
            // fault here.
            let p = buf.top().sub(8);
            p.write_bytes(0xAB, 8);
        }
        release_stack(buf);
    }
}
