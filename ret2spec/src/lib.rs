//! Leaking data through a polluted return stack buffer.
//!
//! See [pollute] for how the attack works, [leak::LeakLoop] for the
//! single-process driver and [coordinator::Coordinator] for the
//! cross-process one.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod evict;
pub mod gadget;
pub mod leak;
pub mod marks;
pub mod oracle;
pub mod pollute;
pub mod retry;
pub mod sidechannel;
pub mod util;

pub use crate::config::*;
pub use crate::error::{ LeakError, Result, EXIT_SUCCESS, EXIT_FAILURE };
pub use crate::leak::LeakLoop;
pub use crate::coordinator::Coordinator;
pub use crate::sidechannel::{ Decision, SideChannel, FlushReload };
pub use crate::oracle::{ Oracle, TimedRead };
pub use crate::util::RsbEnv;
