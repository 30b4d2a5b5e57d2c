//! The state store contract.
//!
//! This trait is the only channel through which the rule engine and the
//! transfer orchestrator share state. Every durable mutation happens here;
//! writers use optimistic version checks and must treat a version conflict
//! as "re-read and recompute". The replica change log with its watermark
//! query drives incremental rule re-evaluation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use datagrid_core::checksum::Checksum;
use datagrid_core::dataset::{Dataset, FileRecord};
use datagrid_core::did::Did;
use datagrid_core::replica::{Replica, ReplicaState};
use datagrid_core::rule::Rule;
use datagrid_core::site::SiteId;
use datagrid_core::transfer::{TransferRequest, TransferState};

use crate::error::StoreError;

/// One entry of the replica change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaChange {
    /// Monotonic sequence number; the watermark is the last seq consumed.
    pub seq: u64,
    /// The affected file.
    pub did: Did,
    /// The affected site.
    pub site: SiteId,
    /// New state, or `None` when the replica row was deleted.
    pub state: Option<ReplicaState>,
    /// Time of the change, microseconds since epoch.
    pub at_us: u64,
}

/// Result of an idempotent transfer enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The request was newly created.
    Created,
    /// A live request with the same (file, destination, rule) key already
    /// exists; nothing was written.
    Duplicate,
}

/// Repository contract over all durable orchestration state.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- files ---

    /// Register a file, or verify an existing registration. A file's size
    /// and checksum are immutable once recorded; a registration that
    /// supplies a checksum for a file without one fills it in.
    async fn register_file(&self, record: FileRecord) -> Result<(), StoreError>;

    /// Fetch a file record.
    async fn get_file(&self, did: &Did) -> Result<FileRecord, StoreError>;

    /// Record the checksum of a file that had none.
    async fn set_file_checksum(&self, did: &Did, checksum: Checksum) -> Result<(), StoreError>;

    // --- datasets ---

    /// Create an empty open dataset.
    async fn create_dataset(&self, did: Did) -> Result<(), StoreError>;

    /// Attach a registered file to an open dataset.
    async fn attach_file(&self, dataset: &Did, file: &Did) -> Result<(), StoreError>;

    /// Close a dataset; membership becomes immutable.
    async fn close_dataset(&self, did: &Did) -> Result<(), StoreError>;

    /// Fetch a dataset.
    async fn get_dataset(&self, did: &Did) -> Result<Dataset, StoreError>;

    /// Resolve a DID to its constituent file records: the file itself, or
    /// all members of a dataset.
    async fn resolve_files(&self, did: &Did) -> Result<Vec<FileRecord>, StoreError>;

    // --- replicas ---

    /// Create a replica row. Fails if a row for (file, site) exists.
    async fn create_replica(
        &self,
        did: &Did,
        site: &SiteId,
        state: ReplicaState,
        now_us: u64,
    ) -> Result<Replica, StoreError>;

    /// Fetch one replica row.
    async fn get_replica(&self, did: &Did, site: &SiteId) -> Result<Replica, StoreError>;

    /// All replica rows of one file.
    async fn list_replicas(&self, did: &Did) -> Result<Vec<Replica>, StoreError>;

    /// Conditionally write a replica row. The caller passes the row as
    /// read (its `version` is the expected version) with fields mutated;
    /// the store rejects version mismatches and illegal state transitions,
    /// and bumps the version on success.
    async fn update_replica(&self, replica: Replica, now_us: u64) -> Result<Replica, StoreError>;

    /// Delete a replica row (after the backend copy is gone).
    async fn delete_replica(&self, did: &Did, site: &SiteId, now_us: u64)
        -> Result<(), StoreError>;

    /// Increment a replica's lock counter (a rule pinning it).
    async fn lock_replica(&self, did: &Did, site: &SiteId) -> Result<(), StoreError>;

    /// Decrement a replica's lock counter; sets the tombstone at zero.
    async fn unlock_replica(&self, did: &Did, site: &SiteId, now_us: u64)
        -> Result<(), StoreError>;

    /// Tombstoned, lock-free replicas at a site, oldest tombstone first,
    /// up to `limit`. Input for the reaper.
    async fn list_unlocked_replicas(
        &self,
        site: &SiteId,
        limit: usize,
    ) -> Result<Vec<Replica>, StoreError>;

    /// Replica changes with `seq` greater than `watermark`, up to `limit`,
    /// plus the new watermark to resume from.
    async fn replicas_changed_since(
        &self,
        watermark: u64,
        limit: usize,
    ) -> Result<(Vec<ReplicaChange>, u64), StoreError>;

    // --- rules ---

    /// Insert a new rule.
    async fn put_rule(&self, rule: Rule) -> Result<(), StoreError>;

    /// Fetch a rule.
    async fn get_rule(&self, id: Uuid) -> Result<Rule, StoreError>;

    /// Conditionally write a rule (same version discipline as replicas).
    async fn update_rule(&self, rule: Rule) -> Result<Rule, StoreError>;

    /// Delete a rule.
    async fn delete_rule(&self, id: Uuid) -> Result<(), StoreError>;

    /// All rules currently stored.
    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError>;

    // --- transfer requests ---

    /// Idempotently enqueue a transfer request: if a non-terminal request
    /// with the same (file, destination, rule) key exists, nothing is
    /// written and `Duplicate` is returned.
    async fn enqueue_transfer(
        &self,
        request: TransferRequest,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Fetch a transfer request.
    async fn get_transfer(&self, id: Uuid) -> Result<TransferRequest, StoreError>;

    /// Conditionally write a transfer request (version discipline).
    async fn update_transfer(
        &self,
        request: TransferRequest,
        now_us: u64,
    ) -> Result<TransferRequest, StoreError>;

    /// All requests currently in `state`.
    async fn list_transfers_by_state(
        &self,
        state: TransferState,
    ) -> Result<Vec<TransferRequest>, StoreError>;

    /// All requests owned by a rule.
    async fn list_transfers_for_rule(&self, rule_id: Uuid)
        -> Result<Vec<TransferRequest>, StoreError>;

    /// Non-terminal requests targeting a file (any destination).
    async fn live_transfers_for_file(&self, did: &Did)
        -> Result<Vec<TransferRequest>, StoreError>;
}
