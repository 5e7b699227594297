//! Error types for this crate.

use thiserror::Error;

/// Catch-all error for this crate. Every variant carries a one-line message
/// suitable for direct display to the user.
#[derive(Debug, Error)]
pub enum Error {
    /// An internal consistency check failed during tracking or windowing.
    /// The process should abort and leave any open files for postmortem.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    /// A voxel or collimator segment references a material that is not
    /// declared in the material table.
    #[error("material index {0} is not declared in the material table")]
    MaterialOutOfRange(usize),
    /// The header of a history file does not match the requested operation.
    #[error("history file mismatch: {0}")]
    FileFormatMismatch(String),
    /// An operation was run against a file whose header disables a required
    /// mode. The message names the specific missing precondition.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// A buffer allocation was refused or a supplied buffer is too small to
    /// hold even a single decay's worth of data.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Underlying read or write failure.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// The cooperative cancellation flag was raised; shutdown was clean.
    #[error("user cancelled")]
    UserCancelled,
}

impl Error {
    /// The process exit code associated with this error kind.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::FileFormatMismatch(_)
            | Self::PreconditionFailed(_)
            | Self::ResourceExhausted(_) => 1,
            Self::InvariantViolated(_) | Self::MaterialOutOfRange(_) | Self::Io(_) => 2,
            Self::UserCancelled => 3,
        }
    }
}

/// Result type with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
