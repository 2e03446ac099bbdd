//! Tracking the frame boundaries of a recursion.

/// Addresses of the "stack marks" of all live frames, innermost last.
///
/// A stack mark is the address of a local in some frame. It stands in for
/// the cache line holding that frame's return address: everything between
/// a frame's mark and its parent's mark is flushed when the frame returns.
///
/// This must never live in a recursive frame itself, since frames are
/// exactly what we're flushing.
#[derive(Debug, Default)]
pub struct StackMarks {
    marks: Vec<usize>,
    high_water: usize,
}
impl StackMarks {
    pub fn with_capacity(cap: usize) -> Self {
        Self { marks: Vec::with_capacity(cap), high_water: 0 }
    }

    /// Record the mark for a newly-entered frame.
    pub fn push(&mut self, mark: *const u8) {
        self.marks.push(mark as usize);
        self.high_water = self.high_water.max(self.marks.len());
    }

    /// Remove the mark for the innermost frame.
    pub fn pop(&mut self) -> Option<usize> {
        self.marks.pop()
    }

    /// Return the mark for the innermost frame.
    pub fn peek(&self) -> Option<usize> {
        self.marks.last().copied()
    }

    pub fn depth(&self) -> usize { self.marks.len() }

    pub fn is_empty(&self) -> bool { self.marks.is_empty() }

    /// The deepest nesting observed so far.
    pub fn high_water(&self) -> usize { self.high_water }
}
