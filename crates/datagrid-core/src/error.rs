//! Shared error taxonomy.
//!
//! Transfer failures are classified as transient (worth retrying) or
//! permanent (terminal for the request). Integrity errors are independent
//! of any one transfer: they describe a file whose recorded identity is
//! missing or contradicted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::did::Did;

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Worth retrying with backoff (timeouts, resets, rate limits).
    Transient,
    /// Terminal for the operation (checksum mismatch, quota, not found).
    Permanent,
}

impl ErrorClass {
    /// True for the transient class.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Data integrity violations, independent of any single transfer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntegrityError {
    /// The file has no recorded checksum, so no new replica may be created.
    #[error("file {did} has no recorded checksum")]
    ChecksumUnknown {
        /// The affected file.
        did: Did,
    },
    /// Observed content disagrees with the recorded checksum.
    #[error("checksum mismatch for {did}: expected {expected}, observed {observed}")]
    ChecksumMismatch {
        /// The affected file.
        did: Did,
        /// Recorded checksum string form.
        expected: String,
        /// Observed checksum string form.
        observed: String,
    },
    /// Observed size disagrees with the recorded size.
    #[error("size mismatch for {did}: expected {expected} bytes, observed {observed}")]
    SizeMismatch {
        /// The affected file.
        did: Did,
        /// Recorded size.
        expected: u64,
        /// Observed size.
        observed: u64,
    },
    /// A re-registration tried to change an already recorded identity.
    #[error("identity of {did} is immutable once recorded")]
    IdentityChanged {
        /// The affected file.
        did: Did,
    },
}
