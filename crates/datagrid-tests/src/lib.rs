//! Integration tests for the replication pipeline.
//!
//! These exercise the crates together over shared in-memory state: rules
//! evaluated by the engine, transfers executed by the orchestrator, and
//! expired replicas reclaimed by the reaper, with real filesystem
//! backends where the scenario calls for one.

pub mod harness;

#[cfg(test)]
mod concurrency;
#[cfg(test)]
mod fs_pipeline;
#[cfg(test)]
mod pipeline;
#[cfg(test)]
mod props;

pub use harness::Grid;
