//! Error type.

use std::sync::PoisonError;

/// Errors returned by [`MsdDevice`](crate::MsdDevice).
///
/// Protocol violations by the host are not errors; they stall the offending pipe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device lock was poisoned by a panicking thread.
    #[error("internal device error")]
    Internal,
    /// A SCSI command is still executing.
    #[error("a SCSI command is in flight")]
    Busy,
    /// Saved state is inconsistent.
    #[error("invalid saved state: {0}")]
    InvalidSavedState(&'static str),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Self::Internal
    }
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;
