//! Background deletion of unlocked replicas and orphaned partials.
//!
//! When the last rule lock on a replica drops, the store tombstones the
//! row. After a grace period the reaper claims the row with a
//! BEING_DELETED transition, removes the backend object, deletes the row,
//! and returns the bytes to the site's usage counters. The version check
//! on the claim means a rule that re-pins the replica during the grace
//! period wins the race and the row is left alone.
//!
//! The reaper also sweeps partial upload keys left behind by crashed
//! transfers. A partial whose file still has an in-flight request at the
//! site is kept, since the owning worker may still promote it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use datagrid_adapters::{AdapterError, AdapterRegistry};
use datagrid_core::replica::ReplicaState;
use datagrid_core::site::{SiteCatalog, SiteId};
use datagrid_core::time::now_us;
use datagrid_store::{StateStore, StoreError};

use crate::error::TransferError;

/// Reaper tunables.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Pause between sweeps.
    pub interval: Duration,
    /// How long a tombstoned replica survives before deletion, in
    /// microseconds. A rule created within the grace period can re-pin
    /// the replica instead of re-transferring it.
    pub grace_us: u64,
    /// Maximum replica rows reaped per site per sweep.
    pub batch: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace_us: 5 * 60 * 1_000_000,
            batch: 64,
        }
    }
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Replica rows deleted along with their backend objects.
    pub deleted: u64,
    /// Orphaned partial uploads removed.
    pub orphans: u64,
    /// Deletions that failed at the backend and will be retried.
    pub errors: u64,
}

impl ReaperStats {
    fn merge(&mut self, other: ReaperStats) {
        self.deleted += other.deleted;
        self.orphans += other.orphans;
        self.errors += other.errors;
    }
}

/// Deletes expired replicas and orphaned partials across all sites.
pub struct Reaper {
    store: Arc<dyn StateStore>,
    registry: Arc<AdapterRegistry>,
    catalog: Arc<RwLock<SiteCatalog>>,
    config: ReaperConfig,
}

impl Reaper {
    /// Create a reaper over the given store, adapters and catalog.
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AdapterRegistry>,
        catalog: Arc<RwLock<SiteCatalog>>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            registry,
            catalog,
            config,
        }
    }

    /// Sweep every registered site once.
    pub async fn sweep(&self, now_us: u64) -> Result<ReaperStats, TransferError> {
        let sites: Vec<SiteId> = {
            let catalog = self.catalog.read().await;
            catalog.sites().map(|s| s.id.clone()).collect()
        };
        let mut stats = ReaperStats::default();
        for site in sites {
            stats.merge(self.sweep_site(&site, now_us).await?);
        }
        if stats != ReaperStats::default() {
            info!(
                deleted = stats.deleted,
                orphans = stats.orphans,
                errors = stats.errors,
                "reaper sweep finished"
            );
        }
        Ok(stats)
    }

    /// Sweep one site: expired tombstoned replicas first, then orphaned
    /// partial uploads.
    pub async fn sweep_site(
        &self,
        site: &SiteId,
        now_us: u64,
    ) -> Result<ReaperStats, TransferError> {
        let mut stats = ReaperStats::default();
        let adapter = match self.registry.for_site(site) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(%site, %err, "site has no adapter, skipping sweep");
                return Ok(stats);
            }
        };

        for replica in self
            .store
            .list_unlocked_replicas(site, self.config.batch)
            .await?
        {
            if !replica.reapable(now_us, self.config.grace_us) {
                continue;
            }
            let did = replica.did.clone();
            let bytes = replica.bytes;

            // Claiming the row with a version check loses to a rule that
            // re-pinned the replica during the grace period.
            let mut claim = replica;
            claim.state = ReplicaState::BeingDeleted;
            if let Err(err) = self.store.update_replica(claim, now_us).await {
                if err.is_conflict() {
                    debug!(%did, %site, "replica re-pinned, skipping");
                    continue;
                }
                return Err(err.into());
            }

            let key = datagrid_adapters::ObjectKey::for_did(&did);
            match adapter.delete(&key).await {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {}
                Err(err) => {
                    // Row stays in BEING_DELETED; the next sweep retries
                    // the backend delete.
                    warn!(%did, %site, %err, "backend delete failed");
                    stats.errors += 1;
                    continue;
                }
            }

            match self.store.delete_replica(&did, site, now_us).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            {
                let mut catalog = self.catalog.write().await;
                let _ = catalog.adjust_usage(site, -(bytes as i64), -1);
            }
            debug!(%did, %site, bytes, "replica reaped");
            stats.deleted += 1;
        }

        for partial in adapter.list_partials().await? {
            let Some(finals) = partial.final_of() else {
                continue;
            };
            let Some(did) = finals.to_did() else {
                continue;
            };
            let live = self.store.live_transfers_for_file(&did).await?;
            if live.iter().any(|t| t.dest == *site) {
                continue;
            }
            match adapter.delete(&partial).await {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {
                    debug!(%did, %site, key = %partial, "orphaned partial removed");
                    stats.orphans += 1;
                }
                Err(err) => {
                    warn!(%site, key = %partial, %err, "orphan delete failed");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Sweep on an interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut tick = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.sweep(now_us()).await {
                        warn!(%err, "reaper sweep failed");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }
}
