//! In-memory reference implementation of the state store.
//!
//! Tables are concurrent maps; the replica change log is a single
//! mutex-guarded vector with a monotonic sequence counter. Version checks
//! and transition guards are enforced here so that every backend exposes
//! the same discipline to writers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use datagrid_core::checksum::Checksum;
use datagrid_core::dataset::{Dataset, FileRecord};
use datagrid_core::did::Did;
use datagrid_core::error::IntegrityError;
use datagrid_core::replica::{Replica, ReplicaState};
use datagrid_core::rule::Rule;
use datagrid_core::site::SiteId;
use datagrid_core::transfer::{TransferRequest, TransferState};

use crate::error::StoreError;
use crate::snapshot::Snapshot;
use crate::store::{EnqueueOutcome, ReplicaChange, StateStore};

type ReplicaKey = (Did, SiteId);
type DedupKey = (Did, SiteId, Uuid);

/// Concurrent in-memory state store.
pub struct MemoryStore {
    files: DashMap<Did, FileRecord>,
    datasets: DashMap<Did, Dataset>,
    replicas: DashMap<ReplicaKey, Replica>,
    rules: DashMap<Uuid, Rule>,
    transfers: DashMap<Uuid, TransferRequest>,
    transfer_index: DashMap<DedupKey, Uuid>,
    change_log: Mutex<Vec<ReplicaChange>>,
    change_seq: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            datasets: DashMap::new(),
            replicas: DashMap::new(),
            rules: DashMap::new(),
            transfers: DashMap::new(),
            transfer_index: DashMap::new(),
            change_log: Mutex::new(Vec::new()),
            change_seq: AtomicU64::new(0),
        }
    }

    fn record_change(&self, did: &Did, site: &SiteId, state: Option<ReplicaState>, now_us: u64) {
        let seq = self.change_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let change = ReplicaChange {
            seq,
            did: did.clone(),
            site: site.clone(),
            state,
            at_us: now_us,
        };
        // Lock poisoning cannot happen: no panics while the guard is held.
        if let Ok(mut log) = self.change_log.lock() {
            log.push(change);
        }
    }

    fn replica_key_str(did: &Did, site: &SiteId) -> String {
        format!("{}@{}", did, site)
    }

    /// Export the full store contents for snapshot persistence.
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            files: self.files.iter().map(|e| e.value().clone()).collect(),
            datasets: self.datasets.iter().map(|e| e.value().clone()).collect(),
            replicas: self.replicas.iter().map(|e| e.value().clone()).collect(),
            rules: self.rules.iter().map(|e| e.value().clone()).collect(),
            transfers: self.transfers.iter().map(|e| e.value().clone()).collect(),
            change_seq: self.change_seq.load(Ordering::SeqCst),
        }
    }

    /// Rebuild a store from a snapshot. The change log itself is not
    /// persisted; consumers resume from the snapshot's sequence watermark.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        for file in snapshot.files {
            store.files.insert(file.did.clone(), file);
        }
        for dataset in snapshot.datasets {
            store.datasets.insert(dataset.did.clone(), dataset);
        }
        for replica in snapshot.replicas {
            store
                .replicas
                .insert((replica.did.clone(), replica.site.clone()), replica);
        }
        for rule in snapshot.rules {
            store.rules.insert(rule.id, rule);
        }
        for transfer in snapshot.transfers {
            if !transfer.state.is_terminal() {
                store
                    .transfer_index
                    .insert(transfer.dedup_key(), transfer.id);
            }
            store.transfers.insert(transfer.id, transfer);
        }
        store.change_seq.store(snapshot.change_seq, Ordering::SeqCst);
        store
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn register_file(&self, record: FileRecord) -> Result<(), StoreError> {
        match self.files.entry(record.did.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if existing.size_bytes != record.size_bytes {
                    return Err(IntegrityError::IdentityChanged {
                        did: record.did.clone(),
                    }
                    .into());
                }
                match (&existing.checksum, &record.checksum) {
                    (Some(a), Some(b)) if a != b => Err(IntegrityError::IdentityChanged {
                        did: record.did.clone(),
                    }
                    .into()),
                    (None, Some(b)) => {
                        existing.checksum = Some(b.clone());
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn get_file(&self, did: &Did) -> Result<FileRecord, StoreError> {
        self.files
            .get(did)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                entity: "file",
                key: did.to_string(),
            })
    }

    async fn set_file_checksum(&self, did: &Did, checksum: Checksum) -> Result<(), StoreError> {
        let mut entry = self.files.get_mut(did).ok_or_else(|| StoreError::NotFound {
            entity: "file",
            key: did.to_string(),
        })?;
        match &entry.checksum {
            Some(existing) if *existing != checksum => {
                Err(IntegrityError::IdentityChanged { did: did.clone() }.into())
            }
            _ => {
                entry.checksum = Some(checksum);
                Ok(())
            }
        }
    }

    async fn create_dataset(&self, did: Did) -> Result<(), StoreError> {
        match self.datasets.entry(did.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Dataset::new(did));
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                entity: "dataset",
                key: did.to_string(),
            }),
        }
    }

    async fn attach_file(&self, dataset: &Did, file: &Did) -> Result<(), StoreError> {
        let size = self.get_file(file).await?.size_bytes;
        let mut entry = self
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| StoreError::NotFound {
                entity: "dataset",
                key: dataset.to_string(),
            })?;
        entry.attach(file.clone(), size)?;
        Ok(())
    }

    async fn close_dataset(&self, did: &Did) -> Result<(), StoreError> {
        let mut entry = self
            .datasets
            .get_mut(did)
            .ok_or_else(|| StoreError::NotFound {
                entity: "dataset",
                key: did.to_string(),
            })?;
        entry.close();
        Ok(())
    }

    async fn get_dataset(&self, did: &Did) -> Result<Dataset, StoreError> {
        self.datasets
            .get(did)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                entity: "dataset",
                key: did.to_string(),
            })
    }

    async fn resolve_files(&self, did: &Did) -> Result<Vec<FileRecord>, StoreError> {
        if let Some(dataset) = self.datasets.get(did) {
            let members: Vec<Did> = dataset.files.iter().cloned().collect();
            drop(dataset);
            let mut records = Vec::with_capacity(members.len());
            for member in &members {
                records.push(self.get_file(member).await?);
            }
            return Ok(records);
        }
        Ok(vec![self.get_file(did).await?])
    }

    async fn create_replica(
        &self,
        did: &Did,
        site: &SiteId,
        state: ReplicaState,
        now_us: u64,
    ) -> Result<Replica, StoreError> {
        let bytes = self.get_file(did).await?.size_bytes;
        let key = (did.clone(), site.clone());
        match self.replicas.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let replica = Replica::new(did.clone(), site.clone(), state, bytes, now_us);
                slot.insert(replica.clone());
                self.record_change(did, site, Some(state), now_us);
                Ok(replica)
            }
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                entity: "replica",
                key: Self::replica_key_str(did, site),
            }),
        }
    }

    async fn get_replica(&self, did: &Did, site: &SiteId) -> Result<Replica, StoreError> {
        self.replicas
            .get(&(did.clone(), site.clone()))
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                entity: "replica",
                key: Self::replica_key_str(did, site),
            })
    }

    async fn list_replicas(&self, did: &Did) -> Result<Vec<Replica>, StoreError> {
        let mut out: Vec<Replica> = self
            .replicas
            .iter()
            .filter(|e| e.value().did == *did)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.site.cmp(&b.site));
        Ok(out)
    }

    async fn update_replica(&self, replica: Replica, now_us: u64) -> Result<Replica, StoreError> {
        let key = (replica.did.clone(), replica.site.clone());
        let key_str = Self::replica_key_str(&replica.did, &replica.site);
        let mut entry = self
            .replicas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "replica",
                key: key_str.clone(),
            })?;
        let current = entry.value_mut();
        if current.version != replica.version {
            return Err(StoreError::VersionConflict {
                entity: "replica",
                key: key_str,
                expected: replica.version,
                found: current.version,
            });
        }
        let state_changed = current.state != replica.state;
        if state_changed && !current.state.can_transition_to(replica.state) {
            return Err(StoreError::IllegalTransition {
                entity: "replica",
                key: key_str,
                reason: format!("{} -> {}", current.state, replica.state),
            });
        }
        if replica.state == ReplicaState::BeingDeleted && current.lock_cnt > 0 {
            return Err(StoreError::IllegalTransition {
                entity: "replica",
                key: key_str,
                reason: format!("{} locks held", current.lock_cnt),
            });
        }
        let mut stored = replica;
        stored.version += 1;
        stored.updated_at_us = now_us;
        *current = stored.clone();
        drop(entry);
        if state_changed {
            debug!(did = %stored.did, site = %stored.site, state = %stored.state, "replica state changed");
            self.record_change(&stored.did, &stored.site, Some(stored.state), now_us);
        }
        Ok(stored)
    }

    async fn delete_replica(
        &self,
        did: &Did,
        site: &SiteId,
        now_us: u64,
    ) -> Result<(), StoreError> {
        let key = (did.clone(), site.clone());
        self.replicas
            .remove(&key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "replica",
                key: Self::replica_key_str(did, site),
            })?;
        self.record_change(did, site, None, now_us);
        Ok(())
    }

    async fn lock_replica(&self, did: &Did, site: &SiteId) -> Result<(), StoreError> {
        let key = (did.clone(), site.clone());
        let mut entry = self
            .replicas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "replica",
                key: Self::replica_key_str(did, site),
            })?;
        entry.lock();
        Ok(())
    }

    async fn unlock_replica(
        &self,
        did: &Did,
        site: &SiteId,
        now_us: u64,
    ) -> Result<(), StoreError> {
        let key = (did.clone(), site.clone());
        let mut entry = self
            .replicas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "replica",
                key: Self::replica_key_str(did, site),
            })?;
        entry.unlock(now_us);
        Ok(())
    }

    async fn list_unlocked_replicas(
        &self,
        site: &SiteId,
        limit: usize,
    ) -> Result<Vec<Replica>, StoreError> {
        let mut out: Vec<Replica> = self
            .replicas
            .iter()
            .filter(|e| {
                let r = e.value();
                r.site == *site
                    && r.lock_cnt == 0
                    && r.tombstone_us.is_some()
                    && matches!(r.state, ReplicaState::Available | ReplicaState::Unavailable)
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| r.tombstone_us);
        out.truncate(limit);
        Ok(out)
    }

    async fn replicas_changed_since(
        &self,
        watermark: u64,
        limit: usize,
    ) -> Result<(Vec<ReplicaChange>, u64), StoreError> {
        let log = self
            .change_log
            .lock()
            .map_err(|_| StoreError::NotFound {
                entity: "change log",
                key: "poisoned".to_string(),
            })?;
        let changes: Vec<ReplicaChange> = log
            .iter()
            .filter(|c| c.seq > watermark)
            .take(limit)
            .cloned()
            .collect();
        let new_watermark = changes.last().map(|c| c.seq).unwrap_or(watermark);
        Ok((changes, new_watermark))
    }

    async fn put_rule(&self, rule: Rule) -> Result<(), StoreError> {
        match self.rules.entry(rule.id) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(rule);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                entity: "rule",
                key: rule.id.to_string(),
            }),
        }
    }

    async fn get_rule(&self, id: Uuid) -> Result<Rule, StoreError> {
        self.rules
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                entity: "rule",
                key: id.to_string(),
            })
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, StoreError> {
        let mut entry = self.rules.get_mut(&rule.id).ok_or_else(|| StoreError::NotFound {
            entity: "rule",
            key: rule.id.to_string(),
        })?;
        let current = entry.value_mut();
        if current.version != rule.version {
            return Err(StoreError::VersionConflict {
                entity: "rule",
                key: rule.id.to_string(),
                expected: rule.version,
                found: current.version,
            });
        }
        let mut stored = rule;
        stored.version += 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<(), StoreError> {
        self.rules.remove(&id).ok_or_else(|| StoreError::NotFound {
            entity: "rule",
            key: id.to_string(),
        })?;
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let mut out: Vec<Rule> = self.rules.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| r.created_at_us);
        Ok(out)
    }

    async fn enqueue_transfer(
        &self,
        request: TransferRequest,
    ) -> Result<EnqueueOutcome, StoreError> {
        let key = request.dedup_key();
        // The entry guard serializes racing enqueues for the same dedup key:
        // the liveness check and the index write happen under one lock. The
        // row is stored before the index points at it.
        match self.transfer_index.entry(key) {
            Entry::Occupied(mut slot) => {
                let live = self
                    .transfers
                    .get(slot.get())
                    .map(|e| !e.state.is_terminal())
                    .unwrap_or(false);
                if live {
                    return Ok(EnqueueOutcome::Duplicate);
                }
                self.transfers.insert(request.id, request.clone());
                slot.insert(request.id);
            }
            Entry::Vacant(slot) => {
                self.transfers.insert(request.id, request.clone());
                slot.insert(request.id);
            }
        }
        debug!(id = %request.id, did = %request.did, dest = %request.dest, "transfer enqueued");
        Ok(EnqueueOutcome::Created)
    }

    async fn get_transfer(&self, id: Uuid) -> Result<TransferRequest, StoreError> {
        self.transfers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                entity: "transfer",
                key: id.to_string(),
            })
    }

    async fn update_transfer(
        &self,
        request: TransferRequest,
        now_us: u64,
    ) -> Result<TransferRequest, StoreError> {
        let mut entry = self
            .transfers
            .get_mut(&request.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "transfer",
                key: request.id.to_string(),
            })?;
        let current = entry.value_mut();
        if current.version != request.version {
            return Err(StoreError::VersionConflict {
                entity: "transfer",
                key: request.id.to_string(),
                expected: request.version,
                found: current.version,
            });
        }
        if current.state.is_terminal() && current.state != request.state {
            return Err(StoreError::IllegalTransition {
                entity: "transfer",
                key: request.id.to_string(),
                reason: format!("{} is terminal", current.state),
            });
        }
        let mut stored = request;
        stored.version += 1;
        stored.updated_at_us = now_us;
        *current = stored.clone();
        Ok(stored)
    }

    async fn list_transfers_by_state(
        &self,
        state: TransferState,
    ) -> Result<Vec<TransferRequest>, StoreError> {
        let mut out: Vec<TransferRequest> = self
            .transfers
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|t| t.created_at_us);
        Ok(out)
    }

    async fn list_transfers_for_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Vec<TransferRequest>, StoreError> {
        let mut out: Vec<TransferRequest> = self
            .transfers
            .iter()
            .filter(|e| e.value().rule_id == rule_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|t| t.created_at_us);
        Ok(out)
    }

    async fn live_transfers_for_file(
        &self,
        did: &Did,
    ) -> Result<Vec<TransferRequest>, StoreError> {
        let mut out: Vec<TransferRequest> = self
            .transfers
            .iter()
            .filter(|e| e.value().did == *did && !e.value().state.is_terminal())
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|t| t.created_at_us);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_core::checksum::Checksum;
    use datagrid_core::rule::SiteFilter;

    fn did(name: &str) -> Did {
        Did::new("test", name).unwrap()
    }

    fn site(id: &str) -> SiteId {
        SiteId::new(id)
    }

    async fn store_with_file(name: &str, bytes: u64) -> MemoryStore {
        let store = MemoryStore::new();
        let record = FileRecord::with_checksum(did(name), bytes, Checksum::blake3_of(b"x"));
        store.register_file(record).await.unwrap();
        store
    }

    mod files {
        use super::*;

        #[tokio::test]
        async fn test_register_and_get() {
            let store = store_with_file("f1", 100).await;
            let record = store.get_file(&did("f1")).await.unwrap();
            assert_eq!(record.size_bytes, 100);
            assert!(record.checksum.is_some());
        }

        #[tokio::test]
        async fn test_reregister_identical_is_idempotent() {
            let store = store_with_file("f1", 100).await;
            let record = FileRecord::with_checksum(did("f1"), 100, Checksum::blake3_of(b"x"));
            store.register_file(record).await.unwrap();
        }

        #[tokio::test]
        async fn test_reregister_different_size_rejected() {
            let store = store_with_file("f1", 100).await;
            let record = FileRecord::new(did("f1"), 101);
            let result = store.register_file(record).await;
            assert!(matches!(
                result,
                Err(StoreError::Integrity(IntegrityError::IdentityChanged { .. }))
            ));
        }

        #[tokio::test]
        async fn test_reregister_different_checksum_rejected() {
            let store = store_with_file("f1", 100).await;
            let record = FileRecord::with_checksum(did("f1"), 100, Checksum::blake3_of(b"y"));
            let result = store.register_file(record).await;
            assert!(matches!(result, Err(StoreError::Integrity(_))));
        }

        #[tokio::test]
        async fn test_fill_in_missing_checksum() {
            let store = MemoryStore::new();
            store.register_file(FileRecord::new(did("f1"), 5)).await.unwrap();
            store
                .set_file_checksum(&did("f1"), Checksum::blake3_of(b"abc"))
                .await
                .unwrap();
            let record = store.get_file(&did("f1")).await.unwrap();
            assert!(record.checksum.is_some());
        }

        #[tokio::test]
        async fn test_overwrite_checksum_rejected() {
            let store = store_with_file("f1", 100).await;
            let result = store
                .set_file_checksum(&did("f1"), Checksum::blake3_of(b"other"))
                .await;
            assert!(matches!(result, Err(StoreError::Integrity(_))));
        }
    }

    mod datasets {
        use super::*;

        #[tokio::test]
        async fn test_resolve_plain_file() {
            let store = store_with_file("f1", 100).await;
            let files = store.resolve_files(&did("f1")).await.unwrap();
            assert_eq!(files.len(), 1);
        }

        #[tokio::test]
        async fn test_resolve_dataset_members() {
            let store = store_with_file("f1", 100).await;
            store.register_file(FileRecord::new(did("f2"), 200)).await.unwrap();
            store.create_dataset(did("ds")).await.unwrap();
            store.attach_file(&did("ds"), &did("f1")).await.unwrap();
            store.attach_file(&did("ds"), &did("f2")).await.unwrap();
            let files = store.resolve_files(&did("ds")).await.unwrap();
            assert_eq!(files.len(), 2);
            let dataset = store.get_dataset(&did("ds")).await.unwrap();
            assert_eq!(dataset.total_bytes, 300);
        }

        #[tokio::test]
        async fn test_attach_after_close_rejected() {
            let store = store_with_file("f1", 100).await;
            store.create_dataset(did("ds")).await.unwrap();
            store.close_dataset(&did("ds")).await.unwrap();
            let result = store.attach_file(&did("ds"), &did("f1")).await;
            assert!(matches!(result, Err(StoreError::Dataset(_))));
        }

        #[tokio::test]
        async fn test_attach_unregistered_file_rejected() {
            let store = MemoryStore::new();
            store.create_dataset(did("ds")).await.unwrap();
            let result = store.attach_file(&did("ds"), &did("ghost")).await;
            assert!(matches!(result, Err(StoreError::NotFound { .. })));
        }

        #[tokio::test]
        async fn test_duplicate_dataset_rejected() {
            let store = MemoryStore::new();
            store.create_dataset(did("ds")).await.unwrap();
            let result = store.create_dataset(did("ds")).await;
            assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
        }
    }

    mod replicas {
        use super::*;

        #[tokio::test]
        async fn test_create_and_list() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            let replicas = store.list_replicas(&did("f1")).await.unwrap();
            assert_eq!(replicas.len(), 1);
            assert_eq!(replicas[0].bytes, 100);
        }

        #[tokio::test]
        async fn test_duplicate_pair_rejected() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await
                .unwrap();
            let result = store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await;
            assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
        }

        #[tokio::test]
        async fn test_update_bumps_version() {
            let store = store_with_file("f1", 100).await;
            let mut replica = store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await
                .unwrap();
            replica.state = ReplicaState::Available;
            let stored = store.update_replica(replica, 2_000).await.unwrap();
            assert_eq!(stored.version, 1);
            assert_eq!(stored.state, ReplicaState::Available);
        }

        #[tokio::test]
        async fn test_stale_version_conflicts() {
            let store = store_with_file("f1", 100).await;
            let replica = store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await
                .unwrap();
            let mut first = replica.clone();
            first.state = ReplicaState::Available;
            store.update_replica(first, 2_000).await.unwrap();

            let mut stale = replica;
            stale.state = ReplicaState::Unavailable;
            let result = store.update_replica(stale, 3_000).await;
            assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        }

        #[tokio::test]
        async fn test_illegal_transition_rejected() {
            let store = store_with_file("f1", 100).await;
            let mut replica = store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await
                .unwrap();
            replica.state = ReplicaState::BeingDeleted;
            let result = store.update_replica(replica, 2_000).await;
            assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
        }

        #[tokio::test]
        async fn test_delete_locked_replica_rejected() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            store.lock_replica(&did("f1"), &site("site-a")).await.unwrap();
            let mut attempt = store.get_replica(&did("f1"), &site("site-a")).await.unwrap();
            attempt.state = ReplicaState::BeingDeleted;
            let result = store.update_replica(attempt, 2_000).await;
            assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
        }

        #[tokio::test]
        async fn test_unlocked_listing_ordered_by_tombstone() {
            let store = store_with_file("f1", 100).await;
            store.register_file(FileRecord::new(did("f2"), 50)).await.unwrap();
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            store
                .create_replica(&did("f2"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            store.unlock_replica(&did("f2"), &site("site-a"), 5_000).await.unwrap();
            store.unlock_replica(&did("f1"), &site("site-a"), 9_000).await.unwrap();

            let unlocked = store.list_unlocked_replicas(&site("site-a"), 10).await.unwrap();
            assert_eq!(unlocked.len(), 2);
            assert_eq!(unlocked[0].did, did("f2"));
            assert_eq!(unlocked[1].did, did("f1"));
        }

        #[tokio::test]
        async fn test_locked_replica_not_listed() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            store.lock_replica(&did("f1"), &site("site-a")).await.unwrap();
            let unlocked = store.list_unlocked_replicas(&site("site-a"), 10).await.unwrap();
            assert!(unlocked.is_empty());
        }
    }

    mod change_log {
        use super::*;

        #[tokio::test]
        async fn test_changes_recorded_and_watermarked() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await
                .unwrap();
            let mut replica = store.get_replica(&did("f1"), &site("site-a")).await.unwrap();
            replica.state = ReplicaState::Available;
            store.update_replica(replica, 2_000).await.unwrap();

            let (changes, watermark) = store.replicas_changed_since(0, 100).await.unwrap();
            assert_eq!(changes.len(), 2);
            assert_eq!(changes[0].state, Some(ReplicaState::Copying));
            assert_eq!(changes[1].state, Some(ReplicaState::Available));
            assert_eq!(watermark, 2);

            let (rest, watermark2) = store.replicas_changed_since(watermark, 100).await.unwrap();
            assert!(rest.is_empty());
            assert_eq!(watermark2, watermark);
        }

        #[tokio::test]
        async fn test_deletion_recorded_as_none() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            store.delete_replica(&did("f1"), &site("site-a"), 2_000).await.unwrap();
            let (changes, _) = store.replicas_changed_since(0, 100).await.unwrap();
            assert_eq!(changes.last().unwrap().state, None);
        }

        #[tokio::test]
        async fn test_no_change_entry_for_pure_field_update() {
            let store = store_with_file("f1", 100).await;
            let mut replica = store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Copying, 1_000)
                .await
                .unwrap();
            replica.bytes = 100;
            store.update_replica(replica, 2_000).await.unwrap();
            let (changes, _) = store.replicas_changed_since(0, 100).await.unwrap();
            assert_eq!(changes.len(), 1);
        }
    }

    mod transfers {
        use super::*;

        fn request(store_did: &Did, dest: &str, rule_id: Uuid) -> TransferRequest {
            TransferRequest::new(store_did.clone(), site(dest), rule_id, 0, 1_000)
        }

        #[tokio::test]
        async fn test_enqueue_dedup() {
            let store = store_with_file("f1", 100).await;
            let rule_id = Uuid::new_v4();
            let first = request(&did("f1"), "site-a", rule_id);
            let second = request(&did("f1"), "site-a", rule_id);
            assert_eq!(
                store.enqueue_transfer(first).await.unwrap(),
                EnqueueOutcome::Created
            );
            assert_eq!(
                store.enqueue_transfer(second).await.unwrap(),
                EnqueueOutcome::Duplicate
            );
        }

        #[tokio::test]
        async fn test_enqueue_after_terminal_allowed() {
            let store = store_with_file("f1", 100).await;
            let rule_id = Uuid::new_v4();
            let first = request(&did("f1"), "site-a", rule_id);
            store.enqueue_transfer(first.clone()).await.unwrap();

            let mut done = store.get_transfer(first.id).await.unwrap();
            done.state = TransferState::Done;
            store.update_transfer(done, 2_000).await.unwrap();

            let second = request(&did("f1"), "site-a", rule_id);
            assert_eq!(
                store.enqueue_transfer(second).await.unwrap(),
                EnqueueOutcome::Created
            );
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_racing_enqueues_dedup_to_one() {
            for _ in 0..100 {
                let store = std::sync::Arc::new(store_with_file("f1", 100).await);
                let rule_id = Uuid::new_v4();
                let mut handles = Vec::new();
                for _ in 0..8 {
                    let store = std::sync::Arc::clone(&store);
                    handles.push(tokio::spawn(async move {
                        store
                            .enqueue_transfer(request(&did("f1"), "site-a", rule_id))
                            .await
                            .unwrap()
                    }));
                }
                let mut created = 0;
                for handle in handles {
                    if handle.await.unwrap() == EnqueueOutcome::Created {
                        created += 1;
                    }
                }
                assert_eq!(created, 1);
                let live = store.live_transfers_for_file(&did("f1")).await.unwrap();
                assert_eq!(live.len(), 1);
            }
        }

        #[tokio::test]
        async fn test_distinct_rules_not_deduped() {
            let store = store_with_file("f1", 100).await;
            let a = request(&did("f1"), "site-a", Uuid::new_v4());
            let b = request(&did("f1"), "site-a", Uuid::new_v4());
            assert_eq!(store.enqueue_transfer(a).await.unwrap(), EnqueueOutcome::Created);
            assert_eq!(store.enqueue_transfer(b).await.unwrap(), EnqueueOutcome::Created);
        }

        #[tokio::test]
        async fn test_update_from_terminal_rejected() {
            let store = store_with_file("f1", 100).await;
            let req = request(&did("f1"), "site-a", Uuid::new_v4());
            store.enqueue_transfer(req.clone()).await.unwrap();
            let mut cancelled = store.get_transfer(req.id).await.unwrap();
            cancelled.state = TransferState::Cancelled;
            let cancelled = store.update_transfer(cancelled, 2_000).await.unwrap();

            let mut revive = cancelled;
            revive.state = TransferState::Queued;
            let result = store.update_transfer(revive, 3_000).await;
            assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
        }

        #[tokio::test]
        async fn test_live_transfers_for_file() {
            let store = store_with_file("f1", 100).await;
            let rule_id = Uuid::new_v4();
            let a = request(&did("f1"), "site-a", rule_id);
            let b = request(&did("f1"), "site-b", rule_id);
            store.enqueue_transfer(a.clone()).await.unwrap();
            store.enqueue_transfer(b).await.unwrap();

            let mut done = store.get_transfer(a.id).await.unwrap();
            done.state = TransferState::Done;
            store.update_transfer(done, 2_000).await.unwrap();

            let live = store.live_transfers_for_file(&did("f1")).await.unwrap();
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].dest, site("site-b"));
        }

        #[tokio::test]
        async fn test_list_by_state_and_rule() {
            let store = store_with_file("f1", 100).await;
            let rule_id = Uuid::new_v4();
            store
                .enqueue_transfer(request(&did("f1"), "site-a", rule_id))
                .await
                .unwrap();
            store
                .enqueue_transfer(request(&did("f1"), "site-b", rule_id))
                .await
                .unwrap();
            let queued = store.list_transfers_by_state(TransferState::Queued).await.unwrap();
            assert_eq!(queued.len(), 2);
            let owned = store.list_transfers_for_rule(rule_id).await.unwrap();
            assert_eq!(owned.len(), 2);
        }
    }

    mod rules {
        use super::*;

        #[tokio::test]
        async fn test_put_get_update() {
            let store = MemoryStore::new();
            let rule = Rule::new(did("ds"), 2, SiteFilter::Any, 1_000);
            store.put_rule(rule.clone()).await.unwrap();

            let mut fetched = store.get_rule(rule.id).await.unwrap();
            fetched.stuck_reason = Some("no eligible sites".to_string());
            let stored = store.update_rule(fetched).await.unwrap();
            assert_eq!(stored.version, 1);
        }

        #[tokio::test]
        async fn test_stale_rule_update_conflicts() {
            let store = MemoryStore::new();
            let rule = Rule::new(did("ds"), 2, SiteFilter::Any, 1_000);
            store.put_rule(rule.clone()).await.unwrap();

            let fresh = store.get_rule(rule.id).await.unwrap();
            store.update_rule(fresh).await.unwrap();

            let result = store.update_rule(rule).await;
            assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        }

        #[tokio::test]
        async fn test_delete_rule() {
            let store = MemoryStore::new();
            let rule = Rule::new(did("ds"), 1, SiteFilter::Any, 0);
            store.put_rule(rule.clone()).await.unwrap();
            store.delete_rule(rule.id).await.unwrap();
            assert!(matches!(
                store.get_rule(rule.id).await,
                Err(StoreError::NotFound { .. })
            ));
        }
    }

    mod snapshots {
        use super::*;

        #[tokio::test]
        async fn test_snapshot_round_trip() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            let rule = Rule::new(did("f1"), 1, SiteFilter::Any, 1_000);
            store.put_rule(rule.clone()).await.unwrap();
            store
                .enqueue_transfer(TransferRequest::new(
                    did("f1"),
                    site("site-b"),
                    rule.id,
                    0,
                    1_000,
                ))
                .await
                .unwrap();

            let snapshot = store.to_snapshot();
            let restored = MemoryStore::from_snapshot(snapshot);

            restored.get_file(&did("f1")).await.unwrap();
            restored.get_replica(&did("f1"), &site("site-a")).await.unwrap();
            restored.get_rule(rule.id).await.unwrap();
            let queued = restored
                .list_transfers_by_state(TransferState::Queued)
                .await
                .unwrap();
            assert_eq!(queued.len(), 1);
        }

        #[tokio::test]
        async fn test_restored_store_keeps_dedup() {
            let store = store_with_file("f1", 100).await;
            let rule_id = Uuid::new_v4();
            store
                .enqueue_transfer(TransferRequest::new(
                    did("f1"),
                    site("site-a"),
                    rule_id,
                    0,
                    1_000,
                ))
                .await
                .unwrap();
            let restored = MemoryStore::from_snapshot(store.to_snapshot());
            let dup = TransferRequest::new(did("f1"), site("site-a"), rule_id, 0, 2_000);
            assert_eq!(
                restored.enqueue_transfer(dup).await.unwrap(),
                EnqueueOutcome::Duplicate
            );
        }

        #[tokio::test]
        async fn test_watermark_survives_snapshot() {
            let store = store_with_file("f1", 100).await;
            store
                .create_replica(&did("f1"), &site("site-a"), ReplicaState::Available, 1_000)
                .await
                .unwrap();
            let restored = MemoryStore::from_snapshot(store.to_snapshot());
            // Old changes are gone, but the sequence resumes past them.
            let (changes, watermark) = restored.replicas_changed_since(0, 100).await.unwrap();
            assert!(changes.is_empty());
            assert_eq!(watermark, 0);
            restored
                .create_replica(&did("f1"), &site("site-b"), ReplicaState::Copying, 2_000)
                .await
                .unwrap();
            let (changes, _) = restored.replicas_changed_since(1, 100).await.unwrap();
            assert_eq!(changes.len(), 1);
        }
    }
}
