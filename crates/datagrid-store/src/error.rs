//! Error types for the state store.

use thiserror::Error;

use datagrid_core::dataset::DatasetError;
use datagrid_core::error::IntegrityError;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with the given key.
    #[error("{entity} {key} not found")]
    NotFound {
        /// Entity kind ("file", "replica", "rule", ...).
        entity: &'static str,
        /// String form of the key.
        key: String,
    },

    /// A row with the given key already exists.
    #[error("{entity} {key} already exists")]
    AlreadyExists {
        /// Entity kind.
        entity: &'static str,
        /// String form of the key.
        key: String,
    },

    /// Optimistic version check failed; the caller must re-read and
    /// recompute. Never surfaced to users.
    #[error("version conflict on {entity} {key}: expected v{expected}, found v{found}")]
    VersionConflict {
        /// Entity kind.
        entity: &'static str,
        /// String form of the key.
        key: String,
        /// Version the writer expected.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },

    /// The requested state transition is not legal.
    #[error("illegal transition on {entity} {key}: {reason}")]
    IllegalTransition {
        /// Entity kind.
        entity: &'static str,
        /// String form of the key.
        key: String,
        /// Why the transition was rejected.
        reason: String,
    },

    /// Data integrity violation.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Dataset membership violation.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Snapshot serialization error.
    #[error("snapshot serialization error")]
    Serialization(#[from] bincode::Error),

    /// Snapshot I/O error.
    #[error("snapshot I/O error")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for conflicts that a writer should resolve by re-reading and
    /// recomputing rather than reporting.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
