//! Store snapshot persistence.
//!
//! A snapshot is the full durable state of the orchestration core. It is
//! written as bincode to a temporary file and renamed into place, so a
//! crash mid-write leaves the previous snapshot intact. Recovery after a
//! restart re-derives all orchestration from the snapshot alone.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use datagrid_core::dataset::{Dataset, FileRecord};
use datagrid_core::replica::Replica;
use datagrid_core::rule::Rule;
use datagrid_core::transfer::TransferRequest;

use crate::error::StoreError;

/// Serialized form of the full store contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// All file records.
    pub files: Vec<FileRecord>,
    /// All datasets.
    pub datasets: Vec<Dataset>,
    /// All replica rows.
    pub replicas: Vec<Replica>,
    /// All rules.
    pub rules: Vec<Rule>,
    /// All transfer requests, terminal ones included.
    pub transfers: Vec<TransferRequest>,
    /// Change-log sequence counter at snapshot time.
    pub change_seq: u64,
}

impl Snapshot {
    /// Write the snapshot to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let encoded = bincode::serialize(self)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), bytes = encoded.len(), "snapshot written");
        Ok(())
    }

    /// Load a snapshot from `path`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let encoded = std::fs::read(path)?;
        Ok(bincode::deserialize(&encoded)?)
    }
}
