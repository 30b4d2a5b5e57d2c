//! Per-site admission control.
//!
//! Each destination site gets a bounded number of in-flight transfers, and
//! a global cap bounds the whole orchestrator. Queued requests wait in
//! per-site priority order: higher priority first, then submission order.
//! Admission picks the best admissible entry across all sites, so one
//! saturated site never starves the others.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use datagrid_core::site::SiteId;

/// Admission tunables.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum in-flight transfers across all sites.
    pub global_limit: usize,
    /// Per-site in-flight limit for sites without an explicit override.
    pub default_site_limit: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_limit: 32,
            default_site_limit: 4,
        }
    }
}

/// Queue position of one request. Orders higher priority first, then
/// earlier submission, with the request id as a final total-order tie
/// break.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: u32,
    seq: u64,
    id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    queued: BTreeMap<SiteId, BTreeSet<Entry>>,
    /// Queued membership by request id, for dedup and removal.
    index: HashMap<Uuid, (SiteId, Entry)>,
    /// In-flight requests and the site whose slot they hold.
    active: HashMap<Uuid, SiteId>,
    per_site_active: HashMap<SiteId, usize>,
    site_limits: HashMap<SiteId, usize>,
    next_seq: u64,
}

/// Priority queue with per-site and global in-flight caps.
pub struct AdmissionQueue {
    config: AdmissionConfig,
    inner: Mutex<Inner>,
}

impl AdmissionQueue {
    /// Create an empty queue.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queue a request for admission to `site`. Returns false if the
    /// request is already queued or in flight.
    pub async fn push(&self, site: &SiteId, id: Uuid, priority: u32) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(&id) || inner.active.contains_key(&id) {
            return false;
        }
        inner.next_seq += 1;
        let entry = Entry {
            priority,
            seq: inner.next_seq,
            id,
        };
        inner
            .queued
            .entry(site.clone())
            .or_default()
            .insert(entry.clone());
        inner.index.insert(id, (site.clone(), entry));
        trace!(request = %id, %site, priority, "request queued for admission");
        true
    }

    /// Admit the best queued request with a free slot, if any.
    pub async fn try_admit(&self) -> Option<(Uuid, SiteId)> {
        let mut inner = self.inner.lock().await;
        if inner.active.len() >= self.config.global_limit {
            return None;
        }
        let mut best: Option<(Entry, SiteId)> = None;
        for (site, entries) in &inner.queued {
            let limit = inner
                .site_limits
                .get(site)
                .copied()
                .unwrap_or(self.config.default_site_limit);
            if inner.per_site_active.get(site).copied().unwrap_or(0) >= limit {
                continue;
            }
            let Some(front) = entries.iter().next() else {
                continue;
            };
            match &best {
                Some((current, _)) if current <= front => {}
                _ => best = Some((front.clone(), site.clone())),
            }
        }
        let (entry, site) = best?;
        if let Some(entries) = inner.queued.get_mut(&site) {
            entries.remove(&entry);
        }
        inner.index.remove(&entry.id);
        inner.active.insert(entry.id, site.clone());
        *inner.per_site_active.entry(site.clone()).or_insert(0) += 1;
        trace!(request = %entry.id, %site, "request admitted");
        Some((entry.id, site))
    }

    /// Release the slot held by an admitted request.
    pub async fn release(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(site) = inner.active.remove(&id) {
            if let Some(count) = inner.per_site_active.get_mut(&site) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Drop a queued request. Returns false if it was not queued (it may
    /// already be in flight or admitted).
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some((site, entry)) = inner.index.remove(&id) else {
            return false;
        };
        if let Some(entries) = inner.queued.get_mut(&site) {
            entries.remove(&entry);
        }
        true
    }

    /// Override the in-flight limit of one site.
    pub async fn set_site_limit(&self, site: &SiteId, limit: usize) {
        let mut inner = self.inner.lock().await;
        inner.site_limits.insert(site.clone(), limit);
    }

    /// Number of requests waiting for admission.
    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    /// Number of requests currently holding slots.
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.active.len()
    }
}
