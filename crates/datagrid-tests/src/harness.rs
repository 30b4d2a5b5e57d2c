//! Shared wiring for integration tests.
//!
//! `Grid` assembles a complete in-memory deployment: one state store and
//! site catalog shared by the rule engine, the transfer orchestrator, and
//! the reaper, with a storage adapter per site. Orchestrator backoff is
//! zeroed so retries resolve synchronously inside `run_once`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::RwLock;
use uuid::Uuid;

use datagrid_adapters::object::ObjectStoreAdapter;
use datagrid_adapters::{AdapterRegistry, ObjectKey, StorageAdapter};
use datagrid_core::checksum::Checksum;
use datagrid_core::dataset::FileRecord;
use datagrid_core::did::Did;
use datagrid_core::replica::ReplicaState;
use datagrid_core::rule::{Rule, RuleState, SiteFilter};
use datagrid_core::site::{ProtocolKind, SiteCatalog, SiteId, SiteRecord};
use datagrid_events::{BufferedNotifier, MemorySink, NotifierConfig};
use datagrid_rule::{EngineConfig, RuleEngine};
use datagrid_store::{MemoryStore, StateStore};
use datagrid_transfer::{
    OrchestratorConfig, Reaper, ReaperConfig, RetryPolicy, TransferOrchestrator,
};

/// Tombstone grace used by the harness reaper, in microseconds.
pub const GRACE_US: u64 = 1_000;

/// A complete in-memory grid sharing one store and catalog.
pub struct Grid {
    /// Shared state store.
    pub store: Arc<MemoryStore>,
    /// Shared site catalog.
    pub catalog: Arc<RwLock<SiteCatalog>>,
    /// Per-site adapters.
    pub registry: Arc<AdapterRegistry>,
    /// Captured lifecycle events.
    pub sink: Arc<MemorySink>,
    /// Rule engine over the shared state.
    pub engine: RuleEngine,
    /// Transfer orchestrator over the shared state.
    pub orchestrator: TransferOrchestrator,
    /// Replica reaper over the shared state.
    pub reaper: Reaper,
}

impl Grid {
    /// Build a grid from site records and their adapters.
    pub fn new(sites: Vec<(SiteRecord, Arc<dyn StorageAdapter>)>) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let mut catalog = SiteCatalog::new();
        let mut registry = AdapterRegistry::new();
        for (record, adapter) in sites {
            registry.register(&record, adapter)?;
            catalog.register(record)?;
        }
        let catalog = Arc::new(RwLock::new(catalog));
        let registry = Arc::new(registry);
        let sink = Arc::new(MemorySink::new());
        let notifier = Arc::new(BufferedNotifier::new(sink.clone(), NotifierConfig::default()));

        let engine = RuleEngine::new(
            store.clone(),
            catalog.clone(),
            notifier.clone(),
            EngineConfig::default(),
        );
        let orchestrator = TransferOrchestrator::new(
            store.clone(),
            registry.clone(),
            catalog.clone(),
            notifier,
            OrchestratorConfig {
                retry: RetryPolicy {
                    base_delay: Duration::ZERO,
                    jitter: 0.0,
                    ..RetryPolicy::default()
                },
                ..OrchestratorConfig::default()
            },
        );
        let reaper = Reaper::new(
            store.clone(),
            registry.clone(),
            catalog.clone(),
            ReaperConfig {
                grace_us: GRACE_US,
                ..ReaperConfig::default()
            },
        );

        Ok(Self {
            store,
            catalog,
            registry,
            sink,
            engine,
            orchestrator,
            reaper,
        })
    }

    /// Build a grid of object-store sites, returning the adapters for
    /// direct inspection.
    pub fn object_sites(ids: &[&str]) -> Result<(Self, HashMap<String, Arc<ObjectStoreAdapter>>)> {
        let mut adapters = HashMap::new();
        let mut sites: Vec<(SiteRecord, Arc<dyn StorageAdapter>)> = Vec::new();
        for id in ids {
            let adapter = Arc::new(ObjectStoreAdapter::new(1 << 30));
            adapters.insert((*id).to_string(), adapter.clone());
            sites.push((
                SiteRecord::new(id, ProtocolKind::ObjectStore, 1 << 30),
                adapter,
            ));
        }
        Ok((Self::new(sites)?, adapters))
    }

    /// Register a file, stage its content at `site`, and record an
    /// AVAILABLE replica there.
    pub async fn seed_file(&self, name: &str, content: &[u8], site: &str) -> Result<Did> {
        let did = Did::new("test", name)?;
        self.store
            .register_file(FileRecord::with_checksum(
                did.clone(),
                content.len() as u64,
                Checksum::blake3_of(content),
            ))
            .await?;
        let site_id = SiteId::new(site);
        let adapter = self.registry.for_site(&site_id)?;
        adapter
            .stage_in(&ObjectKey::for_did(&did), Bytes::copy_from_slice(content))
            .await?;
        self.store
            .create_replica(&did, &site_id, ReplicaState::Available, 100)
            .await?;
        let mut replica = self.store.get_replica(&did, &site_id).await?;
        replica.bytes = content.len() as u64;
        self.store.update_replica(replica, 100).await?;
        Ok(did)
    }

    /// Store a new rule over `did` and return its id.
    pub async fn add_rule(&self, did: &Did, copies: u32) -> Result<Uuid> {
        let rule = Rule::new(did.clone(), copies, SiteFilter::Any, 100);
        self.store.put_rule(rule.clone()).await?;
        Ok(rule.id)
    }

    /// Alternate rule evaluation and transfer execution until the rule
    /// reaches a stable state or the round budget runs out. Returns the
    /// final rule state.
    pub async fn converge(&self, rule_id: Uuid, start_us: u64) -> Result<RuleState> {
        let mut now = start_us;
        for _ in 0..8 {
            let outcome = self.engine.evaluate(rule_id, now).await?;
            if matches!(outcome.state, RuleState::Satisfied | RuleState::Expired) {
                return Ok(outcome.state);
            }
            self.orchestrator.pump().await?;
            self.orchestrator.run_once(now).await?;
            now += 1_000;
        }
        Ok(self.engine.evaluate(rule_id, now).await?.state)
    }

    /// Number of AVAILABLE replicas of a file.
    pub async fn available_replicas(&self, did: &Did) -> Result<usize> {
        Ok(self
            .store
            .list_replicas(did)
            .await?
            .iter()
            .filter(|r| r.state == ReplicaState::Available)
            .count())
    }
}
