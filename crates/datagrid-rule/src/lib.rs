#![warn(missing_docs)]

//! Datagrid rule engine: turns declarative replication rules into the
//! transfer requests needed to satisfy them, re-evaluating incrementally
//! as replica state changes and periodically as a safety net.

pub mod engine;
pub mod error;
pub mod selector;
pub mod sweep;

pub use engine::{EngineConfig, EvaluationOutcome, RuleEngine};
pub use error::RuleError;
pub use sweep::{SweepConfig, SweepStats, Sweeper};
