//! Rule evaluation.
//!
//! `evaluate` is a pure function of store state: it counts the replicas a
//! rule already has, emits transfer requests for the shortfall, and moves
//! the rule through PENDING / SATISFIED / EXPIRED. Idempotence comes from
//! construction: replicas in flight and live requests both cover their
//! destination, and the store deduplicates enqueues on
//! (file, destination, rule), so re-running on unchanged state creates
//! nothing new.
//!
//! The engine is also the lock bookkeeper: every replica counted toward a
//! rule is pinned with a lock, recorded on the rule row so expiry and
//! deletion release exactly what was taken.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use datagrid_core::did::Did;
use datagrid_core::error::IntegrityError;
use datagrid_core::replica::ReplicaState;
use datagrid_core::rule::{Rule, RuleState};
use datagrid_core::site::{SiteCatalog, SiteId};
use datagrid_core::transfer::{TransferRequest, TransferState};
use datagrid_events::{BufferedNotifier, Event};
use datagrid_store::{EnqueueOutcome, StateStore, StoreError};

use crate::error::RuleError;
use crate::selector;

/// Rule engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a (file, destination) pair is excluded from destination
    /// selection after a permanent transfer failure.
    pub failure_cooldown_us: u64,
    /// How many times a version conflict is resolved by re-reading and
    /// recomputing before the conflict is surfaced.
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_cooldown_us: 3_600 * 1_000_000,
            conflict_retries: 5,
        }
    }
}

/// Result of one evaluation.
#[derive(Debug)]
pub struct EvaluationOutcome {
    /// The evaluated rule.
    pub rule_id: Uuid,
    /// Rule state after the pass.
    pub state: RuleState,
    /// Requests newly created by this pass.
    pub created: Vec<TransferRequest>,
    /// Stuck reason after the pass, if any.
    pub stuck_reason: Option<String>,
}

/// Evaluates replication rules against current replica state.
pub struct RuleEngine {
    store: Arc<dyn StateStore>,
    catalog: Arc<RwLock<SiteCatalog>>,
    notifier: Arc<BufferedNotifier>,
    config: EngineConfig,
}

impl RuleEngine {
    /// Create an engine over the given store, site catalog, and notifier.
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<RwLock<SiteCatalog>>,
        notifier: Arc<BufferedNotifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            config,
        }
    }

    /// Evaluate one rule, resolving version conflicts by re-reading and
    /// recomputing up to the configured retry count.
    pub async fn evaluate(
        &self,
        rule_id: Uuid,
        now_us: u64,
    ) -> Result<EvaluationOutcome, RuleError> {
        let mut attempts = 0;
        loop {
            match self.evaluate_pass(rule_id, now_us).await {
                Err(err) if err.is_conflict() && attempts < self.config.conflict_retries => {
                    attempts += 1;
                    debug!(rule = %rule_id, attempts, "version conflict, re-evaluating");
                }
                result => return result,
            }
        }
    }

    /// Delete a rule: cancel its live requests, release its replica locks,
    /// and drop the rule row.
    pub async fn remove(&self, rule_id: Uuid, now_us: u64) -> Result<(), RuleError> {
        let rule = self.store.get_rule(rule_id).await?;
        self.cancel_requests(rule_id, now_us).await?;
        for (did, site) in &rule.locks {
            match self.store.unlock_replica(did, site, now_us).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.store.delete_rule(rule_id).await?;
        info!(rule = %rule_id, "rule removed");
        Ok(())
    }

    /// Change a rule's scheduling priority. Requests already queued keep
    /// the priority they inherited at creation.
    pub async fn set_priority(&self, rule_id: Uuid, priority: u32) -> Result<(), RuleError> {
        let mut attempts = 0;
        loop {
            let mut rule = self.store.get_rule(rule_id).await?;
            rule.priority = priority;
            match self.store.update_rule(rule).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() && attempts < self.config.conflict_retries => {
                    attempts += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn evaluate_pass(
        &self,
        rule_id: Uuid,
        now_us: u64,
    ) -> Result<EvaluationOutcome, RuleError> {
        let mut rule = self.store.get_rule(rule_id).await?;
        if rule.state.is_terminal() {
            return Ok(EvaluationOutcome {
                rule_id,
                state: rule.state,
                created: Vec::new(),
                stuck_reason: rule.stuck_reason,
            });
        }
        if rule.is_expired(now_us) {
            return self.expire_pass(rule, now_us).await;
        }

        let prev_state = rule.state;
        let prev_stuck = rule.stuck_reason.clone();
        let files = self.store.resolve_files(&rule.did).await?;
        let catalog = self.catalog.read().await;

        let mut created = Vec::new();
        let mut counted_keys: BTreeSet<(Did, SiteId)> = BTreeSet::new();
        let mut all_satisfied = true;
        let mut stuck: Option<String> = None;
        let mut integrity: Option<IntegrityError> = None;

        for file in &files {
            let replicas = self.store.list_replicas(&file.did).await?;
            let mut covered: BTreeSet<SiteId> = BTreeSet::new();
            let mut excluded: BTreeSet<SiteId> = BTreeSet::new();
            let mut available_sites = 0u32;
            for replica in &replicas {
                let eligible = catalog
                    .lookup(&replica.site)
                    .map(|s| rule.filter.matches(s))
                    .unwrap_or(false);
                if eligible && replica.state.counts_toward_target() {
                    covered.insert(replica.site.clone());
                    counted_keys.insert((file.did.clone(), replica.site.clone()));
                    if replica.state == ReplicaState::Available {
                        available_sites += 1;
                    }
                }
                if replica.state == ReplicaState::BeingDeleted {
                    excluded.insert(replica.site.clone());
                }
            }
            for transfer in self.store.live_transfers_for_file(&file.did).await? {
                if transfer.state.counts_toward_shortfall() {
                    covered.insert(transfer.dest.clone());
                }
            }

            if available_sites < rule.copies {
                all_satisfied = false;
            }
            let shortfall = rule.copies.saturating_sub(covered.len() as u32);
            if shortfall == 0 {
                continue;
            }
            // New replica creation requires an established checksum.
            if file.checksum.is_none() {
                integrity = Some(IntegrityError::ChecksumUnknown {
                    did: file.did.clone(),
                });
                stuck = Some(format!("file {} has no recorded checksum", file.did));
                break;
            }

            excluded.extend(covered.iter().cloned());
            for transfer in self.store.list_transfers_for_rule(rule.id).await? {
                if transfer.did == file.did
                    && transfer.state == TransferState::Failed
                    && now_us.saturating_sub(transfer.updated_at_us)
                        < self.config.failure_cooldown_us
                {
                    excluded.insert(transfer.dest.clone());
                }
            }
            let candidates =
                selector::rank_destinations(&catalog, &rule.filter, file.size_bytes, &excluded);
            if candidates.is_empty() {
                if stuck.is_none() {
                    stuck = Some(format!("no eligible destination site for {}", file.did));
                }
                continue;
            }
            for dest in candidates.into_iter().take(shortfall as usize) {
                let request = TransferRequest::new(
                    file.did.clone(),
                    dest.clone(),
                    rule.id,
                    rule.priority,
                    now_us,
                );
                match self.store.enqueue_transfer(request.clone()).await? {
                    EnqueueOutcome::Created => {
                        debug!(rule = %rule.id, did = %request.did, dest = %dest,
                            "transfer request created");
                        created.push(request);
                    }
                    EnqueueOutcome::Duplicate => {}
                }
            }
        }
        drop(catalog);

        // Pin newly counted replicas before the rule row records them.
        let to_lock: Vec<(Did, SiteId)> = counted_keys.difference(&rule.locks).cloned().collect();
        for (did, site) in &to_lock {
            self.store.lock_replica(did, site).await?;
        }
        rule.locks.extend(to_lock.iter().cloned());

        // Locks on replicas that stopped counting are released, but only
        // after a complete pass saw every file.
        let stale: Vec<(Did, SiteId)> = if integrity.is_none() {
            rule.locks.difference(&counted_keys).cloned().collect()
        } else {
            Vec::new()
        };
        for key in &stale {
            rule.locks.remove(key);
        }

        rule.state = if integrity.is_none() && all_satisfied {
            RuleState::Satisfied
        } else {
            RuleState::Pending
        };
        rule.stuck_reason = stuck;

        let changed = rule.state != prev_state
            || rule.stuck_reason != prev_stuck
            || !to_lock.is_empty()
            || !stale.is_empty();
        if changed {
            match self.store.update_rule(rule.clone()).await {
                Ok(updated) => rule = updated,
                Err(err) => {
                    if err.is_conflict() {
                        // Undo this pass's locks; the retry re-derives
                        // them from fresh state.
                        for (did, site) in &to_lock {
                            let _ = self.store.unlock_replica(did, site, now_us).await;
                        }
                    }
                    return Err(err.into());
                }
            }
            for (did, site) in &stale {
                match self.store.unlock_replica(did, site, now_us).await {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if rule.state == RuleState::Satisfied && prev_state != RuleState::Satisfied {
            info!(rule = %rule.id, did = %rule.did, "rule satisfied");
            self.notifier
                .emit(Event::RuleSatisfied {
                    rule_id: rule.id,
                    did: rule.did.clone(),
                    at_us: now_us,
                })
                .await;
        }
        if let Some(reason) = &rule.stuck_reason {
            if prev_stuck.as_deref() != Some(reason.as_str()) {
                warn!(rule = %rule.id, reason = %reason, "rule stuck");
                self.notifier
                    .emit(Event::RuleStuck {
                        rule_id: rule.id,
                        did: rule.did.clone(),
                        reason: reason.clone(),
                        at_us: now_us,
                    })
                    .await;
            }
        }

        if let Some(err) = integrity {
            return Err(err.into());
        }
        Ok(EvaluationOutcome {
            rule_id,
            state: rule.state,
            created,
            stuck_reason: rule.stuck_reason,
        })
    }

    /// Expire a rule: cancel its requests, persist the terminal state,
    /// then release its locks. A crash between the last two steps leaks
    /// locks rather than freeing a replica another rule still counts.
    async fn expire_pass(
        &self,
        mut rule: Rule,
        now_us: u64,
    ) -> Result<EvaluationOutcome, RuleError> {
        self.cancel_requests(rule.id, now_us).await?;
        let released: Vec<(Did, SiteId)> = rule.locks.iter().cloned().collect();
        rule.locks.clear();
        rule.state = RuleState::Expired;
        let rule = self.store.update_rule(rule).await?;
        for (did, site) in released {
            match self.store.unlock_replica(&did, &site, now_us).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(rule = %rule.id, did = %rule.did, "rule expired");
        Ok(EvaluationOutcome {
            rule_id: rule.id,
            state: RuleState::Expired,
            created: Vec::new(),
            stuck_reason: rule.stuck_reason,
        })
    }

    async fn cancel_requests(&self, rule_id: Uuid, now_us: u64) -> Result<(), RuleError> {
        for mut request in self.store.list_transfers_for_rule(rule_id).await? {
            if request.state.is_terminal() {
                continue;
            }
            request.state = TransferState::Cancelled;
            match self.store.update_transfer(request, now_us).await {
                Ok(_) => {}
                // A worker is writing this request concurrently; it sees
                // the rule's terminal state at its next commit.
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
