#![warn(missing_docs)]

//! Datagrid state store: the orchestration core's view of persisted
//! dataset, replica, rule, and transfer-request state.

pub mod error;
pub mod memory;
pub mod snapshot;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{EnqueueOutcome, ReplicaChange, StateStore};
