#![warn(missing_docs)]

//! Datagrid transfer orchestrator: executes queued transfer requests
//! against storage adapters under admission control, verifies every copy
//! by checksum before publishing it, retries transient failures with
//! backoff, and reaps replicas whose last rule lock has expired.

pub mod admission;
pub mod error;
pub mod orchestrator;
pub mod reaper;
pub mod retry;

pub use admission::{AdmissionConfig, AdmissionQueue};
pub use error::TransferError;
pub use orchestrator::{OrchestratorConfig, TransferOrchestrator};
pub use reaper::{Reaper, ReaperConfig, ReaperStats};
pub use retry::RetryPolicy;
