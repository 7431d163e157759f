//! Unix stack mapping using mmap.

use weft_core::error::{MemoryError, SchedResult};

/// Page size used for guard-page rounding. Linux on both supported
/// architectures uses 4 KiB pages by default; query once at first use.
fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// An mmap'd fiber stack with a guard page at the low end.
///
/// Layout, low to high: one PROT_NONE guard page, then `size` usable
/// bytes. `top()` is the one-past-the-end address handed to
/// `init_context`.
pub struct StackBuffer {
    base: *mut u8,
    total: usize,
    size: usize,
}

// The buffer is plain memory; ownership moves with the value.
unsafe impl Send for StackBuffer {}

impl StackBuffer {
    /// Map a new stack of at least `size` usable bytes.
    pub fn map(size: usize) -> SchedResult<StackBuffer> {
        let page = page_size();
        if size == 0 || size % page != 0 {
            return Err(MemoryError::BadStackSize(size).into());
        }
        let total = size + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed.into());
        }

        // Guard page at the low end stays PROT_NONE: overflow walks
        // down into it and faults.
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            unsafe {
                libc::munmap(base, total);
            }
            return Err(MemoryError::ProtectionFailed.into());
        }

        Ok(StackBuffer {
            base: base as *mut u8,
            total,
            size,
        })
    }

    /// Usable stack size in bytes (guard page excluded).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One-past-the-end address of the usable region. Stacks grow
    /// down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Lowest usable address (just above the guard page).
    #[inline]
    #[allow(dead_code)]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.total - self.size) }
    }
}

impl Drop for StackBuffer {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rejects_bad_sizes() {
        assert!(StackBuffer::map(0).is_err());
        assert!(StackBuffer::map(1000).is_err());
    }

    #[test]
    fn test_map_and_layout() {
        let page = page_size();
        let buf = StackBuffer::map(16 * page).unwrap();
        assert_eq!(buf.size(), 16 * page);
        assert_eq!(buf.top() as usize - buf.bottom() as usize, 16 * page);
        // Top is page aligned, which implies the 16-byte alignment
        // init_context needs.
        assert_eq!(buf.top() as usize % page, 0);
    }
}
