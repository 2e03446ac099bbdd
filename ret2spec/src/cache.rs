//! Low-level cache primitives.

use core::arch::x86_64::{ _mm_clflush, _mm_mfence, _mm_lfence };

/// L1D line size on every part we care about.
pub const CACHE_LINE_SIZE: usize = 64;

/// Implemented on types which can evict a single line from the data cache.
pub trait LineFlush {
    fn flush_line(&self, addr: usize);

    /// Wait for outstanding flushes to complete.
    fn fence(&self) {}
}

/// Evict lines with `CLFLUSH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clflush;
impl LineFlush for Clflush {
    #[inline(always)]
    fn flush_line(&self, addr: usize) {
        // CLFLUSH never faults on a mapped address, and every address we
        // hand it is either a live stack slot or part of the oracle.
        unsafe { _mm_clflush(addr as *const u8) }
    }

    #[inline(always)]
    fn fence(&self) {
        unsafe { _mm_mfence() }
    }
}

/// Flush every line in `[start, end)` with the given stride.
pub fn flush_range<F: LineFlush>(f: &F, start: usize, end: usize, stride: usize) {
    let mut addr = start;
    while addr < end {
        f.flush_line(addr);
        addr += stride;
    }
}

/// Read a byte in a way the compiler can't elide.
///
/// # Safety
/// `ptr` must be valid for reads.
#[inline(always)]
pub unsafe fn force_read(ptr: *const u8) -> u8 {
    unsafe { core::ptr::read_volatile(ptr) }
}

/// Serialize everything before the next load.
#[inline(always)]
pub fn full_fence() {
    unsafe {
        _mm_mfence();
        _mm_lfence();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::cell::RefCell;

    /// Records flushed addresses instead of flushing them.
    #[derive(Default)]
    pub struct RecordingFlush {
        pub lines: RefCell<Vec<usize>>,
    }
    impl LineFlush for RecordingFlush {
        fn flush_line(&self, addr: usize) {
            self.lines.borrow_mut().push(addr);
        }
    }

    #[test]
    fn range_stride() {
        let f = RecordingFlush::default();
        flush_range(&f, 0x1000, 0x1100, CACHE_LINE_SIZE);
        assert_eq!(*f.lines.borrow(), vec![0x1000, 0x1040, 0x1080, 0x10c0]);
    }

    #[test]
    fn range_empty() {
        let f = RecordingFlush::default();
        flush_range(&f, 0x2000, 0x1000, CACHE_LINE_SIZE);
        assert!(f.lines.borrow().is_empty());
    }

    #[test]
    fn clflush_then_read() {
        let x = Box::new([0x5au8; 128]);
        Clflush.flush_line(x.as_ptr() as usize);
        Clflush.fence();
        assert_eq!(unsafe { force_read(x.as_ptr()) }, 0x5a);
    }
}
