//! Error types.

use thiserror::Error;

/// Process exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;

/// Process exit code for any setup or convergence failure.
pub const EXIT_FAILURE: i32 = 1;

pub type Result<T> = std::result::Result<T, LeakError>;

/// Errors that can end a leak run.
///
/// A trial that simply fails to decide is *not* an error: the leak loop
/// retries until the convergence ceiling is crossed.
#[derive(Debug, Error)]
pub enum LeakError {
    /// The scheduler rejected our affinity request.
    #[error("couldn't pin to CPU core {core}: {errno}")]
    Setup { core: usize, errno: nix::errno::Errno },

    /// No decision was reached for `offset` within the trial ceiling.
    #[error("offset {offset} does not converge after {trials} trials \
        (last guess {last_guess:#04x})")]
    ConvergenceExceeded { offset: usize, trials: usize, last_guess: u8 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Some OS primitive used to coordinate the two roles failed.
    #[error("{what} failed: {errno}")]
    Os { what: &'static str, errno: nix::errno::Errno },

    /// Couldn't map the oracle or emit the timed probe.
    #[error("oracle setup failed: {0}")]
    Oracle(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LeakError {
    /// The process exit code associated with this error.
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }

    pub(crate) fn os(what: &'static str) -> impl FnOnce(nix::errno::Errno) -> Self {
        move |errno| Self::Os { what, errno }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn convergence_message_names_offset() {
        let e = LeakError::ConvergenceExceeded {
            offset: 0, trials: 11, last_guess: 0x41
        };
        let msg = e.to_string();
        assert!(msg.contains("offset 0"), "{}", msg);
        assert!(msg.contains("0x41"), "{}", msg);
        assert_eq!(e.exit_code(), EXIT_FAILURE);
    }
}
