//! Error types for the transfer orchestrator.

use thiserror::Error;

use datagrid_adapters::{AdapterError, RegistryError};
use datagrid_core::did::Did;
use datagrid_core::error::ErrorClass;
use datagrid_store::StoreError;

/// Errors from transfer execution and reaping.
#[derive(Debug, Error)]
pub enum TransferError {
    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Storage backend failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// No adapter registered for a site the transfer needs.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No available replica exists to copy from. Transient: a source may
    /// appear once another transfer completes.
    #[error("no viable source replica for {did}")]
    NoViableSource {
        /// The file with no usable source.
        did: Did,
    },
}

impl TransferError {
    /// Retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Adapter(err) => err.class(),
            Self::NoViableSource { .. } => ErrorClass::Transient,
            Self::Store(_) | Self::Registry(_) => ErrorClass::Permanent,
        }
    }

    /// True for store version conflicts, resolved by re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }
}
