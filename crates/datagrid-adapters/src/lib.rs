#![warn(missing_docs)]

//! Datagrid protocol adapters: a capability-based interface over
//! heterogeneous storage backends, with a stable transient/permanent error
//! classification so the orchestrator's retry policy stays backend-agnostic.

pub mod adapter;
pub mod bulk;
pub mod error;
pub mod fs;
pub mod object;
pub mod registry;

pub use adapter::{ObjectKey, StorageAdapter};
pub use error::AdapterError;
pub use registry::{AdapterRegistry, RegistryError};
