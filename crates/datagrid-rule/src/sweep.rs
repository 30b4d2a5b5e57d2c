//! Evaluation triggering.
//!
//! Replica changes are consumed incrementally from the store's change log
//! via a watermark; every change re-evaluates the rules whose target files
//! it touches. A periodic full pass over all non-terminal rules catches
//! anything the incremental path missed, so evaluation is at-least-once.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, warn};

use datagrid_core::did::Did;
use datagrid_core::rule::Rule;
use datagrid_core::time::now_us;
use datagrid_store::{StateStore, StoreError};

use crate::engine::RuleEngine;
use crate::error::RuleError;

/// Sweep tunables.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between ticks.
    pub interval: std::time::Duration,
    /// Maximum replica changes consumed per tick.
    pub change_batch_limit: usize,
    /// Every this many ticks, evaluate all non-terminal rules instead of
    /// only the ones touched by replica changes. The first tick is always
    /// a full pass so restart recovery needs no special case.
    pub full_every: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(30),
            change_batch_limit: 256,
            full_every: 10,
        }
    }
}

/// Counters from one sweep tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Rules evaluated this tick.
    pub evaluated: usize,
    /// Rules whose evaluation failed (logged, not fatal to the sweep).
    pub errors: usize,
    /// True when this tick was a full pass.
    pub full: bool,
}

/// Drives rule evaluation from replica changes and a periodic full pass.
pub struct Sweeper {
    engine: Arc<RuleEngine>,
    store: Arc<dyn StateStore>,
    config: SweepConfig,
    watermark: AtomicU64,
    ticks: AtomicU64,
}

impl Sweeper {
    /// Create a sweeper resuming from change-log sequence `watermark`
    /// (zero for a fresh store, the snapshot's sequence after a restart).
    pub fn new(
        engine: Arc<RuleEngine>,
        store: Arc<dyn StateStore>,
        config: SweepConfig,
        watermark: u64,
    ) -> Self {
        Self {
            engine,
            store,
            config,
            watermark: AtomicU64::new(watermark),
            ticks: AtomicU64::new(0),
        }
    }

    /// Last change-log sequence this sweeper has consumed.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Run one tick: consume pending replica changes and evaluate the
    /// affected rules, or every non-terminal rule on a full pass.
    pub async fn tick(&self, at_us: u64) -> Result<SweepStats, RuleError> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        let full = self.config.full_every > 0 && tick % self.config.full_every == 0;

        let watermark = self.watermark.load(Ordering::SeqCst);
        let (changes, new_watermark) = self
            .store
            .replicas_changed_since(watermark, self.config.change_batch_limit)
            .await?;
        let changed_dids: BTreeSet<Did> = changes.into_iter().map(|c| c.did).collect();

        let mut stats = SweepStats {
            evaluated: 0,
            errors: 0,
            full,
        };
        for rule in self.store.list_rules().await? {
            if rule.state.is_terminal() {
                continue;
            }
            if !full && !self.touches(&rule, &changed_dids).await? {
                continue;
            }
            stats.evaluated += 1;
            if let Err(err) = self.engine.evaluate(rule.id, at_us).await {
                stats.errors += 1;
                warn!(rule = %rule.id, %err, "sweep evaluation failed");
            }
        }

        self.watermark.store(new_watermark, Ordering::SeqCst);
        debug!(
            tick,
            full,
            evaluated = stats.evaluated,
            watermark = new_watermark,
            "sweep tick complete"
        );
        Ok(stats)
    }

    /// Tick on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick(now_us()).await {
                        warn!(%err, "sweep tick failed");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }

    /// True if any changed DID belongs to the rule's target set.
    async fn touches(&self, rule: &Rule, changed: &BTreeSet<Did>) -> Result<bool, RuleError> {
        if changed.is_empty() {
            return Ok(false);
        }
        if changed.contains(&rule.did) {
            return Ok(true);
        }
        match self.store.get_dataset(&rule.did).await {
            Ok(dataset) => Ok(dataset.files.iter().any(|f| changed.contains(f))),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
