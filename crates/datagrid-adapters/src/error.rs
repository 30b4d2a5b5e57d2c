//! Adapter error types and their retry classification.
//!
//! Every adapter maps backend-specific failures onto this one enum, and
//! the classification of each variant never changes: the orchestrator's
//! retry policy depends on it.

use thiserror::Error;

use datagrid_core::error::ErrorClass;

/// Errors from storage adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Operation did not complete in time. Transient.
    #[error("timeout during {op} on {key}")]
    Timeout {
        /// Operation name ("stage_in", "checksum", ...).
        op: &'static str,
        /// Affected object key.
        key: String,
    },

    /// Connection dropped mid-operation. Transient.
    #[error("connection reset during {op} on {key}")]
    ConnectionReset {
        /// Operation name.
        op: &'static str,
        /// Affected object key.
        key: String,
    },

    /// Backend asked us to slow down. Transient.
    #[error("rate limited during {op} on {key}")]
    RateLimited {
        /// Operation name.
        op: &'static str,
        /// Affected object key.
        key: String,
    },

    /// Object not present at the site. Permanent.
    #[error("object {key} not found")]
    NotFound {
        /// Missing object key.
        key: String,
    },

    /// Destination has no room for the object. Permanent.
    #[error("quota exceeded staging {key}: {needed} bytes needed, {available} available")]
    QuotaExceeded {
        /// Affected object key.
        key: String,
        /// Bytes the object requires.
        needed: u64,
        /// Bytes remaining at the destination.
        available: u64,
    },

    /// Backend reported an unclassified failure; treated as permanent so a
    /// misbehaving backend cannot trap requests in a retry loop.
    #[error("backend error during {op} on {key}: {msg}")]
    Backend {
        /// Operation name.
        op: &'static str,
        /// Affected object key.
        key: String,
        /// Backend-provided message.
        msg: String,
    },

    /// Underlying I/O failure; classification follows the error kind.
    #[error("I/O error during {op} on {key}")]
    Io {
        /// Operation name.
        op: &'static str,
        /// Affected object key.
        key: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl AdapterError {
    /// Stable retry classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::ConnectionReset { .. } | Self::RateLimited { .. } => {
                ErrorClass::Transient
            }
            Self::NotFound { .. } | Self::QuotaExceeded { .. } | Self::Backend { .. } => {
                ErrorClass::Permanent
            }
            Self::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::WouldBlock => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }

    /// Wrap an I/O error with operation context.
    pub fn io(op: &'static str, key: &str, source: std::io::Error) -> Self {
        Self::Io {
            op,
            key: key.to_string(),
            source,
        }
    }
}
