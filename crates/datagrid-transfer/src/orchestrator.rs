//! Transfer execution.
//!
//! The orchestrator owns every request from admission to a terminal
//! state. A worker drives one request at a time: pick sources, pin the
//! destination replica row, copy through a partial key, verify, promote,
//! commit. Every store write is an optimistic version check, so a
//! concurrent cancel or a competing worker is detected as a conflict and
//! the copy is rolled back instead of committed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use datagrid_adapters::{AdapterRegistry, ObjectKey};
use datagrid_core::did::Did;
use datagrid_core::error::ErrorClass;
use datagrid_core::replica::{Replica, ReplicaState};
use datagrid_core::site::{SiteCatalog, SiteId, SiteRecord};
use datagrid_core::time::now_us;
use datagrid_core::transfer::{TransferRequest, TransferState};
use datagrid_events::{BufferedNotifier, Event};
use datagrid_locality::{LocalityResolver, PairHealthTracker};
use datagrid_store::{StateStore, StoreError};

use crate::admission::{AdmissionConfig, AdmissionQueue};
use crate::error::TransferError;
use crate::retry::RetryPolicy;

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retry budget and backoff for transient failures.
    pub retry: RetryPolicy,
    /// Admission caps.
    pub admission: AdmissionConfig,
    /// How often the store is polled for queued requests the notifier
    /// missed.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            admission: AdmissionConfig::default(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Destination replica row at the start of an attempt.
enum DestRow {
    /// Row pinned in COPYING; the attempt may proceed.
    Ready(Replica),
    /// A verified copy already exists; nothing to transfer.
    AlreadyAvailable,
    /// The row cannot be claimed right now.
    Blocked(String),
}

/// Executes transfer requests against storage adapters.
pub struct TransferOrchestrator {
    store: Arc<dyn StateStore>,
    registry: Arc<AdapterRegistry>,
    resolver: LocalityResolver,
    health: Mutex<PairHealthTracker>,
    catalog: Arc<RwLock<SiteCatalog>>,
    notifier: Arc<BufferedNotifier>,
    admission: Arc<AdmissionQueue>,
    /// Requests flagged for cancellation while a worker may hold them.
    cancelled: DashMap<Uuid, ()>,
    /// Requests sitting out a backoff delay; the pump skips them.
    deferred: Arc<DashMap<Uuid, ()>>,
    work_available: Arc<Notify>,
    config: OrchestratorConfig,
}

impl TransferOrchestrator {
    /// Create an orchestrator over the given store, adapters, catalog,
    /// and notifier.
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AdapterRegistry>,
        catalog: Arc<RwLock<SiteCatalog>>,
        notifier: Arc<BufferedNotifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            resolver: LocalityResolver::default(),
            health: Mutex::new(PairHealthTracker::new()),
            catalog,
            notifier,
            admission: Arc::new(AdmissionQueue::new(config.admission.clone())),
            cancelled: DashMap::new(),
            deferred: Arc::new(DashMap::new()),
            work_available: Arc::new(Notify::new()),
            config,
        }
    }

    /// Hand a freshly enqueued request to the admission queue.
    pub async fn submit(&self, request: &TransferRequest) -> bool {
        let pushed = self
            .admission
            .push(&request.dest, request.id, request.priority)
            .await;
        if pushed {
            self.work_available.notify_one();
        }
        pushed
    }

    /// Push every QUEUED request in the store that is not already queued,
    /// in flight, or waiting out a backoff. Returns the number pushed.
    pub async fn pump(&self) -> Result<usize, TransferError> {
        let mut pushed = 0;
        for request in self
            .store
            .list_transfers_by_state(TransferState::Queued)
            .await?
        {
            if self.deferred.contains_key(&request.id) {
                continue;
            }
            if self
                .admission
                .push(&request.dest, request.id, request.priority)
                .await
            {
                pushed += 1;
            }
        }
        if pushed > 0 {
            self.work_available.notify_one();
        }
        Ok(pushed)
    }

    /// Restart recovery: requests that were in flight when the process
    /// died go back to QUEUED with their attempt count intact, then the
    /// queue is re-primed from the store.
    pub async fn recover(&self, now_us: u64) -> Result<usize, TransferError> {
        let mut demoted = 0;
        for state in [TransferState::Submitted, TransferState::Copying] {
            for mut request in self.store.list_transfers_by_state(state).await? {
                request.state = TransferState::Queued;
                match self.store.update_transfer(request, now_us).await {
                    Ok(_) => demoted += 1,
                    Err(err) if err.is_conflict() => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if demoted > 0 {
            info!(demoted, "in-flight transfers demoted for recovery");
        }
        self.pump().await?;
        Ok(demoted)
    }

    /// Cancel a request. Queued requests become CANCELLED immediately;
    /// an in-flight request is flagged and its worker rolls back at the
    /// next checkpoint.
    pub async fn cancel(&self, id: Uuid, now_us: u64) -> Result<(), TransferError> {
        self.cancelled.insert(id, ());
        self.admission.remove(id).await;
        loop {
            let request = match self.store.get_transfer(id).await {
                Ok(request) => request,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if request.state.is_terminal() {
                self.cancelled.remove(&id);
                return Ok(());
            }
            if request.state != TransferState::Queued {
                // A worker holds it; the flag takes effect at its next
                // cancellation checkpoint.
                return Ok(());
            }
            let mut target = request;
            target.state = TransferState::Cancelled;
            match self.store.update_transfer(target, now_us).await {
                Ok(_) => {
                    self.cancelled.remove(&id);
                    self.deferred.remove(&id);
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Copy the per-site in-flight limits out of the site catalog.
    pub async fn apply_site_limits(&self) {
        let limits: Vec<(SiteId, usize)> = {
            let catalog = self.catalog.read().await;
            catalog
                .sites()
                .map(|s| (s.id.clone(), s.max_concurrent_transfers))
                .collect()
        };
        for (site, limit) in limits {
            self.admission.set_site_limit(&site, limit).await;
        }
    }

    /// Admit and execute requests until the queue has nothing admissible,
    /// one at a time. Returns the number executed.
    pub async fn run_once(&self, now_us: u64) -> Result<usize, TransferError> {
        let mut executed = 0;
        while let Some((id, _site)) = self.admission.try_admit().await {
            let result = self.execute(id, now_us).await;
            self.admission.release(id).await;
            result?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Worker loop: execute admitted requests concurrently until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        self.apply_site_limits().await;
        let mut poll = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.pump().await {
                        warn!(%err, "queue pump failed");
                    }
                }
                _ = self.work_available.notified() => {}
                _ = shutdown.notified() => break,
            }
            while let Some((id, _site)) = self.admission.try_admit().await {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(err) = this.execute(id, now_us()).await {
                        warn!(request = %id, %err, "transfer execution failed");
                    }
                    this.admission.release(id).await;
                    this.work_available.notify_one();
                });
            }
        }
    }

    /// Run one admitted request to a terminal state or back to QUEUED.
    async fn execute(&self, id: Uuid, now_us: u64) -> Result<(), TransferError> {
        let request = match self.store.get_transfer(id).await {
            Ok(request) => request,
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if request.state != TransferState::Queued {
            return Ok(());
        }
        if !self.rule_alive(request.rule_id).await? {
            self.cancelled.remove(&id);
            return self.mark_cancelled(request, now_us).await;
        }
        if self.cancelled.remove(&id).is_some() {
            return self.mark_cancelled(request, now_us).await;
        }

        let file = self.store.get_file(&request.did).await?;
        let Some(expected) = file.checksum.clone() else {
            // The rule engine never enqueues such requests; a row without
            // a recorded checksum cannot be verified and never will be.
            let msg = format!("file {} has no recorded checksum", request.did);
            return self.fail(request, msg, now_us).await;
        };

        let sources = self.rank_sources(&request.did, &request.dest, now_us).await?;
        let mut request = request;
        request.state = TransferState::Submitted;
        request.sources = sources;
        request.attempts += 1;
        let mut request = match self.store.update_transfer(request, now_us).await {
            Ok(request) => request,
            // Cancelled between admission and submission.
            Err(StoreError::VersionConflict { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if request.sources.is_empty() {
            let msg = format!("no viable source replica for {}", request.did);
            return self
                .retry_or_fail(request, msg, ErrorClass::Transient, now_us)
                .await;
        }

        let replica = match self.ensure_dest_replica(&request, now_us).await? {
            DestRow::Ready(replica) => replica,
            DestRow::AlreadyAvailable => return self.finish_done(request, now_us).await,
            DestRow::Blocked(reason) => {
                return self
                    .retry_or_fail(request, reason, ErrorClass::Transient, now_us)
                    .await
            }
        };

        request.state = TransferState::Copying;
        let request = match self.store.update_transfer(request, now_us).await {
            Ok(request) => request,
            Err(StoreError::VersionConflict { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let dest_adapter = self.registry.for_site(&request.dest)?;
        let key = ObjectKey::for_did(&request.did);

        // A re-attempt may find the object fully staged by a crashed
        // predecessor; verify instead of copying again.
        if request.attempts > 1 {
            if let Ok(sum) = dest_adapter.checksum(&key, expected.kind()).await {
                if sum == expected {
                    debug!(request = %request.id, dest = %request.dest,
                        "verified object already at destination");
                    return self
                        .commit(request, replica, None, file.size_bytes, now_us)
                        .await;
                }
            }
        }

        let mut last: Option<(String, ErrorClass)> = None;
        for source in request.sources.clone() {
            if self.cancelled.contains_key(&request.id) {
                break;
            }
            let src_adapter = match self.registry.for_site(&source) {
                Ok(adapter) => adapter,
                Err(_) => continue,
            };
            let data = match src_adapter.stage_out(&key).await {
                Ok(data) => data,
                Err(err) => {
                    self.record_failure(&source, &request.dest, now_us).await;
                    last = Some((format!("stage out from {}: {}", source, err), err.class()));
                    continue;
                }
            };
            if !expected.verify(&data) {
                // This copy is corrupt; another source may be clean.
                self.record_failure(&source, &request.dest, now_us).await;
                last = Some((
                    format!("content at {} disagrees with recorded checksum", source),
                    ErrorClass::Transient,
                ));
                continue;
            }
            let partial = key.partial_of();
            if let Err(err) = dest_adapter.stage_in(&partial, data).await {
                self.record_failure(&source, &request.dest, now_us).await;
                last = Some((format!("stage in to {}: {}", request.dest, err), err.class()));
                continue;
            }
            let observed = match dest_adapter.checksum(&partial, expected.kind()).await {
                Ok(sum) => sum,
                Err(err) => {
                    let _ = dest_adapter.delete(&partial).await;
                    self.record_failure(&source, &request.dest, now_us).await;
                    last = Some((format!("checksum at {}: {}", request.dest, err), err.class()));
                    continue;
                }
            };
            if observed != expected {
                // The source bytes verified, so the destination corrupted
                // them. Failing permanently keeps a bad endpoint from
                // consuming the whole retry budget.
                let _ = dest_adapter.delete(&partial).await;
                self.record_failure(&source, &request.dest, now_us).await;
                self.mark_dest_unavailable(&request, now_us).await;
                let msg = format!(
                    "checksum mismatch at {}: expected {}, observed {}",
                    request.dest, expected, observed
                );
                return self.fail(request, msg, now_us).await;
            }
            if let Err(err) = dest_adapter.promote(&partial, &key).await {
                self.record_failure(&source, &request.dest, now_us).await;
                last = Some((format!("promote at {}: {}", request.dest, err), err.class()));
                continue;
            }
            return self
                .commit(request, replica, Some(source), file.size_bytes, now_us)
                .await;
        }

        if self.cancelled.remove(&request.id).is_some() {
            self.mark_dest_unavailable(&request, now_us).await;
            return self.mark_cancelled(request, now_us).await;
        }
        let (msg, class) = last.unwrap_or((
            format!("no viable source replica for {}", request.did),
            ErrorClass::Transient,
        ));
        self.retry_or_fail(request, msg, class, now_us).await
    }

    /// Rank source sites holding an AVAILABLE replica of `did`, best
    /// first for a transfer toward `dest`.
    async fn rank_sources(
        &self,
        did: &Did,
        dest: &SiteId,
        now_us: u64,
    ) -> Result<Vec<SiteId>, TransferError> {
        let replicas = self.store.list_replicas(did).await?;
        let catalog = self.catalog.read().await;
        let Some(dest_record) = catalog.lookup(dest) else {
            return Ok(Vec::new());
        };
        let candidates: Vec<SiteRecord> = replicas
            .iter()
            .filter(|r| r.state == ReplicaState::Available)
            .filter_map(|r| catalog.lookup(&r.site).cloned())
            .collect();
        let health = self.health.lock().await;
        Ok(self
            .resolver
            .rank_sources(dest_record, &candidates, &health, now_us))
    }

    /// Claim the destination replica row for this attempt.
    async fn ensure_dest_replica(
        &self,
        request: &TransferRequest,
        now_us: u64,
    ) -> Result<DestRow, TransferError> {
        match self.store.get_replica(&request.did, &request.dest).await {
            Err(StoreError::NotFound { .. }) => {
                match self
                    .store
                    .create_replica(&request.did, &request.dest, ReplicaState::Copying, now_us)
                    .await
                {
                    Ok(replica) => Ok(DestRow::Ready(replica)),
                    Err(StoreError::AlreadyExists { .. }) => Ok(DestRow::Blocked(
                        "destination replica row appeared concurrently".to_string(),
                    )),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
            Ok(replica) => match replica.state {
                ReplicaState::Available => Ok(DestRow::AlreadyAvailable),
                ReplicaState::Copying => Ok(DestRow::Ready(replica)),
                ReplicaState::Unavailable => {
                    let mut claim = replica;
                    claim.state = ReplicaState::Copying;
                    match self.store.update_replica(claim, now_us).await {
                        Ok(replica) => Ok(DestRow::Ready(replica)),
                        Err(err) if err.is_conflict() => Ok(DestRow::Blocked(
                            "destination replica row changed concurrently".to_string(),
                        )),
                        Err(err) => Err(err.into()),
                    }
                }
                ReplicaState::BeingDeleted => Ok(DestRow::Blocked(
                    "destination replica is being deleted".to_string(),
                )),
            },
        }
    }

    /// Finish a verified copy: replica AVAILABLE, request DONE, usage and
    /// health accounted, event emitted. `source` is `None` when the bytes
    /// were already in place.
    async fn commit(
        &self,
        mut request: TransferRequest,
        mut replica: Replica,
        source: Option<SiteId>,
        bytes: u64,
        now_us: u64,
    ) -> Result<(), TransferError> {
        replica.state = ReplicaState::Available;
        replica.bytes = bytes;
        match self.store.update_replica(replica, now_us).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                return self
                    .retry_or_fail(
                        request,
                        "destination replica row changed during the copy".to_string(),
                        ErrorClass::Transient,
                        now_us,
                    )
                    .await;
            }
            Err(err) => return Err(err.into()),
        }

        request.state = TransferState::Done;
        request.last_error = None;
        let id = request.id;
        let did = request.did.clone();
        let dest = request.dest.clone();
        match self.store.update_transfer(request, now_us).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::IllegalTransition { .. }) => {
                if let Ok(current) = self.store.get_transfer(id).await {
                    if current.state == TransferState::Cancelled {
                        // Cancelled while the bytes moved; undo the copy.
                        self.rollback_copy(&did, &dest, now_us).await;
                        return Ok(());
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }

        {
            let mut catalog = self.catalog.write().await;
            let _ = catalog.adjust_usage(&dest, bytes as i64, 1);
        }
        if let Some(source) = &source {
            self.health
                .lock()
                .await
                .record_success(source, &dest, now_us);
        }
        info!(request = %id, did = %did, dest = %dest, bytes, "replica created");
        self.notifier
            .emit(Event::ReplicaCreated {
                did,
                site: dest,
                at_us: now_us,
            })
            .await;
        Ok(())
    }

    /// Mark a request DONE when the destination already held a verified
    /// copy, so no bytes were moved and no accounting changes.
    async fn finish_done(
        &self,
        mut request: TransferRequest,
        now_us: u64,
    ) -> Result<(), TransferError> {
        request.state = TransferState::Done;
        request.last_error = None;
        match self.store.update_transfer(request, now_us).await {
            Ok(_)
            | Err(StoreError::VersionConflict { .. })
            | Err(StoreError::IllegalTransition { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Re-queue a transiently failed request, or fail it when the error
    /// is permanent or the budget is spent.
    async fn retry_or_fail(
        &self,
        request: TransferRequest,
        msg: String,
        class: ErrorClass,
        now_us: u64,
    ) -> Result<(), TransferError> {
        if class == ErrorClass::Permanent || self.config.retry.exhausted(request.attempts) {
            self.mark_dest_unavailable(&request, now_us).await;
            return self.fail(request, msg, now_us).await;
        }
        let mut request = request;
        request.state = TransferState::Queued;
        request.last_error = Some(msg.clone());
        let request = match self.store.update_transfer(request, now_us).await {
            Ok(request) => request,
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::IllegalTransition { .. }) => {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };
        let delay = self.config.retry.backoff(request.attempts);
        debug!(request = %request.id, attempts = request.attempts, ?delay, error = %msg,
            "transient failure, re-queueing");
        if delay.is_zero() {
            self.admission
                .push(&request.dest, request.id, request.priority)
                .await;
            self.work_available.notify_one();
        } else {
            self.deferred.insert(request.id, ());
            let admission = Arc::clone(&self.admission);
            let notify = Arc::clone(&self.work_available);
            let deferred = Arc::clone(&self.deferred);
            let id = request.id;
            let dest = request.dest.clone();
            let priority = request.priority;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                deferred.remove(&id);
                admission.push(&dest, id, priority).await;
                notify.notify_one();
            });
        }
        Ok(())
    }

    /// Terminally fail a request and publish the failure.
    async fn fail(
        &self,
        mut request: TransferRequest,
        msg: String,
        now_us: u64,
    ) -> Result<(), TransferError> {
        request.state = TransferState::Failed;
        request.last_error = Some(msg.clone());
        let request = match self.store.update_transfer(request, now_us).await {
            Ok(request) => request,
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::IllegalTransition { .. }) => {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };
        warn!(request = %request.id, did = %request.did, dest = %request.dest, error = %msg,
            "transfer failed");
        self.notifier
            .emit(Event::TransferFailed {
                request_id: request.id,
                rule_id: request.rule_id,
                did: request.did.clone(),
                site: request.dest.clone(),
                reason: msg,
                at_us: now_us,
            })
            .await;
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        mut request: TransferRequest,
        now_us: u64,
    ) -> Result<(), TransferError> {
        request.state = TransferState::Cancelled;
        match self.store.update_transfer(request, now_us).await {
            Ok(_)
            | Err(StoreError::VersionConflict { .. })
            | Err(StoreError::IllegalTransition { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn rule_alive(&self, rule_id: Uuid) -> Result<bool, TransferError> {
        match self.store.get_rule(rule_id).await {
            Ok(rule) => Ok(!rule.state.is_terminal()),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Release a COPYING claim after a failed or abandoned attempt, so
    /// the rule engine stops counting the destination as covered.
    async fn mark_dest_unavailable(&self, request: &TransferRequest, now_us: u64) {
        if let Ok(mut replica) = self.store.get_replica(&request.did, &request.dest).await {
            if replica.state == ReplicaState::Copying {
                replica.state = ReplicaState::Unavailable;
                let _ = self.store.update_replica(replica, now_us).await;
            }
        }
    }

    /// Undo a committed copy that lost the race with a cancel.
    async fn rollback_copy(&self, did: &Did, dest: &SiteId, now_us: u64) {
        if let Ok(adapter) = self.registry.for_site(dest) {
            let _ = adapter.delete(&ObjectKey::for_did(did)).await;
        }
        if let Ok(mut replica) = self.store.get_replica(did, dest).await {
            if replica.state == ReplicaState::Available {
                replica.state = ReplicaState::Unavailable;
                let _ = self.store.update_replica(replica, now_us).await;
            }
        }
    }

    async fn record_failure(&self, source: &SiteId, dest: &SiteId, now_us: u64) {
        self.health.lock().await.record_failure(source, dest, now_us);
    }
}
