//! Evicting a returned frame from the data cache.

use crate::cache::LineFlush;

/// The region of the stack occupied by one frame: from its own mark up to
/// (and including) its parent's mark. The stack grows down, so `start` is
/// below `end` for any well-formed pair of marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvictionRange {
    pub start: usize,
    pub end: usize,
}
impl EvictionRange {
    pub fn new(own_mark: usize, parent_mark: usize) -> Self {
        Self { start: own_mark, end: parent_mark }
    }

    /// Return every address that should be flushed, in order.
    ///
    /// The distance between marks is generally not a multiple of the line
    /// size, so `end` is always flushed explicitly. It's also the slot
    /// closest to the parent's return address.
    pub fn lines(&self, line_size: usize) -> impl Iterator<Item=usize> {
        let end = self.end;
        (self.start..end).step_by(line_size).chain(std::iter::once(end))
    }
}

/// Flushes a frame's [EvictionRange] when the frame returns.
pub struct FrameEviction<'f, F: LineFlush> {
    flusher: &'f F,
    line_size: usize,
}
impl <'f, F: LineFlush> FrameEviction<'f, F> {
    pub fn new(flusher: &'f F, line_size: usize) -> Self {
        Self { flusher, line_size }
    }

    /// Evict everything between `own_mark` and `parent_mark`.
    ///
    /// Must only be called after the frame's callee has returned and after
    /// the frame has popped its own mark (so that `parent_mark` really is
    /// the parent's). Flushing an already-evicted line is harmless.
    #[inline(always)]
    pub fn evict(&self, own_mark: usize, parent_mark: usize) {
        let range = EvictionRange::new(own_mark, parent_mark);
        for addr in range.lines(self.line_size) {
            self.flusher.flush_line(addr);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::test::RecordingFlush;
    use crate::cache::{ Clflush, CACHE_LINE_SIZE };

    #[test]
    fn range_covers_parent_mark() {
        let r = EvictionRange::new(0x7000_0010, 0x7000_00a0);
        let lines: Vec<usize> = r.lines(64).collect();
        assert_eq!(lines, vec![0x7000_0010, 0x7000_0050, 0x7000_0090,
            0x7000_00a0]);
    }

    #[test]
    fn inverted_range_flushes_parent_only() {
        let r = EvictionRange::new(0x2000, 0x1000);
        assert_eq!(r.lines(64).collect::<Vec<_>>(), vec![0x1000]);
    }

    #[test]
    fn evict_is_idempotent() {
        let f = RecordingFlush::default();
        let ev = FrameEviction::new(&f, CACHE_LINE_SIZE);
        ev.evict(0x1000, 0x1234);
        let first = f.lines.borrow().clone();
        ev.evict(0x1000, 0x1234);
        let all = f.lines.borrow().clone();
        assert_eq!(&all[..first.len()], &first[..]);
        assert_eq!(&all[first.len()..], &first[..]);
    }

    #[test]
    fn evict_real_stack_twice() {
        let parent = [0u8; 256];
        let own = 0u8;
        let ev = FrameEviction::new(&Clflush, CACHE_LINE_SIZE);
        let (o, p) = (&own as *const u8 as usize, parent.as_ptr() as usize);
        ev.evict(o.min(p), o.max(p));
        ev.evict(o.min(p), o.max(p));
        assert_eq!(own, 0);
        assert_eq!(parent[255], 0);
    }
}
