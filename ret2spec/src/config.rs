//! Leak configuration.

use clap::Parser;
use crate::cache::CACHE_LINE_SIZE;
use crate::error::{ LeakError, Result };

/// The secret leaked when none is given on the command line.
pub const DEFAULT_SECRET: &str = "It's a s3kr3t!!!";

/// Upper bound on the recursion depth.
///
/// The single-process variant nests `2 * depth + 2` frames, so this keeps
/// us well clear of the main thread's stack limit.
pub const MAX_RECURSION_DEPTH: usize = 4096;

/// Which process plays the polluter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Variant {
    /// The victim pollutes the RSB itself, from the bottom of its own
    /// recursion.
    SingleProcess,
    /// A forked process pinned to the same core pollutes the RSB and the
    /// victim yields to it.
    CrossProcess,
}

/// How the polluter learns that the victim has exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LivenessKind {
    /// EOF on a pipe whose write end is only held by the victim.
    Pipe,
    /// Poll `getppid()` against the victim's recorded PID.
    ParentPid,
}

/// Command-line arguments shared by the demo binaries.
#[derive(Parser, Debug, Clone)]
#[command(verbatim_doc_comment)]
pub struct LeakArgs {
    /// Recursion depth. Should be at least the RSB capacity.
    #[arg(long)]
    pub depth: Option<usize>,

    /// Number of undecided trials tolerated per byte before giving up.
    #[arg(long)]
    pub max_trials: Option<usize>,

    /// Pin to this CPU core before leaking.
    #[arg(long)]
    pub core: Option<usize>,

    /// The secret to leak.
    #[arg(long)]
    pub secret: Option<String>,

    /// Liveness signal used by the polluter (cross-process only).
    #[arg(long, value_enum)]
    pub liveness: Option<LivenessKind>,

    /// Lead over the runner-up score required to decide a byte.
    #[arg(long)]
    pub min_lead: Option<usize>,

    /// Print a hexdump of the leaked bytes when done.
    #[arg(long)]
    pub hexdump: bool,
}
impl LeakArgs {
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.as_deref().unwrap_or(DEFAULT_SECRET).as_bytes().to_vec()
    }
}

/// Configuration passed to [crate::leak::LeakLoop] and
/// [crate::coordinator::Coordinator].
#[derive(Clone, Copy, Debug)]
pub struct LeakConfig {
    pub variant: Variant,

    /// Depth of both recursions. Must be at least the RSB capacity.
    pub recursion_depth: usize,

    /// Undecided trials tolerated per byte.
    pub max_trials: usize,

    /// Stride used when evicting a frame.
    pub line_size: usize,

    /// Optionally pin to a specific hardware thread.
    pub pinned_core: Option<usize>,

    /// Liveness signal for the cross-process polluter.
    pub liveness: LivenessKind,

    /// Lead over the runner-up score required by [crate::FlushReload].
    pub min_lead: usize,
}

impl LeakConfig {
    const DEFAULT_DEPTH: usize = 64;
    const DEFAULT_MAX_TRIALS: usize = 100_000;
    const DEFAULT_MIN_LEAD: usize = 40;

    pub fn default_single_process() -> Self {
        Self {
            variant: Variant::SingleProcess,
            recursion_depth: Self::DEFAULT_DEPTH,
            max_trials: Self::DEFAULT_MAX_TRIALS,
            line_size: CACHE_LINE_SIZE,
            pinned_core: None,
            liveness: LivenessKind::Pipe,
            min_lead: Self::DEFAULT_MIN_LEAD,
        }
    }

    /// Both processes need to run on the same core, so we pin to core 0
    /// before forking (the polluter inherits the mask).
    pub fn default_cross_process() -> Self {
        Self {
            variant: Variant::CrossProcess,
            recursion_depth: Self::DEFAULT_DEPTH,
            max_trials: Self::DEFAULT_MAX_TRIALS,
            line_size: CACHE_LINE_SIZE,
            pinned_core: Some(0),
            liveness: LivenessKind::Pipe,
            min_lead: Self::DEFAULT_MIN_LEAD,
        }
    }

    pub fn default_for(variant: Variant) -> Self {
        match variant {
            Variant::SingleProcess => Self::default_single_process(),
            Variant::CrossProcess => Self::default_cross_process(),
        }
    }

    /// Apply any overrides from the command line.
    pub fn from_cmdline_args(args: &LeakArgs, variant: Variant) -> Self {
        let mut res = Self::default_for(variant);
        if let Some(depth) = args.depth {
            res = res.recursion_depth(depth);
        }
        if let Some(max) = args.max_trials {
            res = res.max_trials(max);
        }
        if let Some(core) = args.core {
            res = res.pinned_core(Some(core));
        }
        if let Some(kind) = args.liveness {
            res = res.liveness(kind);
        }
        if let Some(lead) = args.min_lead {
            res = res.min_lead(lead);
        }
        res
    }
}

impl LeakConfig {
    pub fn variant(mut self, x: Variant) -> Self {
        self.variant = x;
        self
    }
    pub fn recursion_depth(mut self, x: usize) -> Self {
        self.recursion_depth = x;
        self
    }
    pub fn max_trials(mut self, x: usize) -> Self {
        self.max_trials = x;
        self
    }
    pub fn line_size(mut self, x: usize) -> Self {
        self.line_size = x;
        self
    }
    pub fn pinned_core(mut self, x: Option<usize>) -> Self {
        self.pinned_core = x;
        self
    }
    pub fn liveness(mut self, x: LivenessKind) -> Self {
        self.liveness = x;
        self
    }
    pub fn min_lead(mut self, x: usize) -> Self {
        self.min_lead = x;
        self
    }
}

impl LeakConfig {
    /// Reject configurations that can't possibly work (or would overflow
    /// the stack).
    pub fn validate(&self) -> Result<()> {
        if self.recursion_depth == 0 {
            return Err(LeakError::InvalidConfig(
                "recursion depth must be non-zero".to_string()
            ));
        }
        if self.recursion_depth > MAX_RECURSION_DEPTH {
            return Err(LeakError::InvalidConfig(format!(
                "recursion depth {} exceeds the limit of {}",
                self.recursion_depth, MAX_RECURSION_DEPTH
            )));
        }
        if !self.line_size.is_power_of_two() {
            return Err(LeakError::InvalidConfig(format!(
                "line size {} is not a power of two", self.line_size
            )));
        }
        Ok(())
    }
}
