//! Storage sites and the site catalog.
//!
//! A site is a storage endpoint with a declared transfer protocol,
//! capacity, geographic location, and bandwidth class. The catalog tracks
//! the known sites together with their usage counters, which are adjusted
//! whenever replicas are created or deleted at a site.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique site identifier (lowercase by convention, e.g. `"site-cern-eos"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(String);

impl SiteId {
    /// Build a site id from a string.
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Transfer protocol spoken by a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Flat-namespace object store (S3-like).
    ObjectStore,
    /// SSH-style file transfer with a hierarchical namespace.
    SshFile,
    /// Parallel-stream bulk transfer (GridFTP-like).
    Bulk,
}

/// Declared bandwidth class of a site's uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BandwidthClass {
    /// Research backbone, 100 Gb/s or better.
    Backbone,
    /// 10-100 Gb/s.
    High,
    /// 1-10 Gb/s.
    Standard,
    /// Below 1 Gb/s or metered.
    Constrained,
}

impl BandwidthClass {
    /// Relative weight used when ranking transfer sources (higher is better).
    pub fn weight(&self) -> f64 {
        match self {
            Self::Backbone => 1.0,
            Self::High => 0.75,
            Self::Standard => 0.5,
            Self::Constrained => 0.2,
        }
    }
}

/// Geographic coordinates of a site, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    /// Latitude in degrees, positive north.
    pub lat_deg: f64,
    /// Longitude in degrees, positive east.
    pub lon_deg: f64,
}

/// Record of a known storage site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    /// Unique site identifier.
    pub id: SiteId,
    /// Human-readable display name.
    pub display_name: String,
    /// Transfer protocol this site speaks.
    pub protocol: ProtocolKind,
    /// Geographic location, if declared.
    pub location: Option<GeoCoord>,
    /// Declared uplink bandwidth class.
    pub bandwidth_class: BandwidthClass,
    /// Administrative priority for destination selection (higher wins).
    pub priority: u32,
    /// Total declared capacity in bytes.
    pub capacity_bytes: u64,
    /// Bytes currently consumed by replicas.
    pub used_bytes: u64,
    /// Number of replicas currently recorded at this site.
    pub replica_count: u64,
    /// Maximum concurrent in-flight transfers admitted to this site.
    pub max_concurrent_transfers: usize,
    /// Free-form tags used by rule site filters (e.g. `"tier1"`, `"tape"`).
    pub tags: BTreeSet<String>,
    /// False while the site is administratively or observably down.
    pub available: bool,
}

impl SiteRecord {
    /// Create a record with the given id, protocol and capacity; remaining
    /// fields take neutral defaults.
    pub fn new(id: &str, protocol: ProtocolKind, capacity_bytes: u64) -> Self {
        Self {
            id: SiteId::new(id),
            display_name: id.to_string(),
            protocol,
            location: None,
            bandwidth_class: BandwidthClass::Standard,
            priority: 0,
            capacity_bytes,
            used_bytes: 0,
            replica_count: 0,
            max_concurrent_transfers: 4,
            tags: BTreeSet::new(),
            available: true,
        }
    }

    /// Capacity not yet consumed by replicas.
    pub fn capacity_remaining(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// True if a new replica of `bytes` would fit.
    pub fn fits(&self, bytes: u64) -> bool {
        self.capacity_remaining() >= bytes
    }
}

/// Errors from site catalog operations.
#[derive(Debug, Error, PartialEq)]
pub enum SiteCatalogError {
    /// Site is already registered.
    #[error("site {site} is already registered")]
    AlreadyRegistered {
        /// The offending site id.
        site: SiteId,
    },
    /// Site not found in the catalog.
    #[error("site {site} not found")]
    NotFound {
        /// The missing site id.
        site: SiteId,
    },
}

/// In-memory catalog of known storage sites.
pub struct SiteCatalog {
    sites: HashMap<SiteId, SiteRecord>,
}

impl SiteCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            sites: HashMap::new(),
        }
    }

    /// Register a new site. Fails if the id is already taken.
    pub fn register(&mut self, record: SiteRecord) -> Result<(), SiteCatalogError> {
        if self.sites.contains_key(&record.id) {
            return Err(SiteCatalogError::AlreadyRegistered {
                site: record.id.clone(),
            });
        }
        self.sites.insert(record.id.clone(), record);
        Ok(())
    }

    /// Remove a site, returning its record.
    pub fn unregister(&mut self, site: &SiteId) -> Result<SiteRecord, SiteCatalogError> {
        self.sites
            .remove(site)
            .ok_or_else(|| SiteCatalogError::NotFound { site: site.clone() })
    }

    /// Look up a site by id.
    pub fn lookup(&self, site: &SiteId) -> Option<&SiteRecord> {
        self.sites.get(site)
    }

    /// Adjust the usage counters of a site after replicas were added
    /// (positive deltas) or deleted (negative deltas).
    pub fn adjust_usage(
        &mut self,
        site: &SiteId,
        delta_bytes: i64,
        delta_replicas: i64,
    ) -> Result<(), SiteCatalogError> {
        let record = self
            .sites
            .get_mut(site)
            .ok_or_else(|| SiteCatalogError::NotFound { site: site.clone() })?;
        record.used_bytes = add_signed(record.used_bytes, delta_bytes);
        record.replica_count = add_signed(record.replica_count, delta_replicas);
        Ok(())
    }

    /// Mark a site available or unavailable.
    pub fn set_available(&mut self, site: &SiteId, available: bool) -> Result<(), SiteCatalogError> {
        let record = self
            .sites
            .get_mut(site)
            .ok_or_else(|| SiteCatalogError::NotFound { site: site.clone() })?;
        record.available = available;
        Ok(())
    }

    /// Iterate over all registered sites.
    pub fn sites(&self) -> impl Iterator<Item = &SiteRecord> {
        self.sites.values()
    }

    /// Number of registered sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// True if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Default for SiteCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn add_signed(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: &str) -> SiteRecord {
        SiteRecord::new(id, ProtocolKind::ObjectStore, 1 << 40)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut catalog = SiteCatalog::new();
        catalog.register(site("site-a")).unwrap();
        assert_eq!(catalog.len(), 1);
        let found = catalog.lookup(&SiteId::new("site-a")).unwrap();
        assert_eq!(found.display_name, "site-a");
    }

    #[test]
    fn test_register_duplicate() {
        let mut catalog = SiteCatalog::new();
        catalog.register(site("site-a")).unwrap();
        let result = catalog.register(site("site-a"));
        assert!(matches!(
            result,
            Err(SiteCatalogError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_unregister_missing() {
        let mut catalog = SiteCatalog::new();
        let result = catalog.unregister(&SiteId::new("nope"));
        assert!(matches!(result, Err(SiteCatalogError::NotFound { .. })));
    }

    #[test]
    fn test_adjust_usage_add_and_remove() {
        let mut catalog = SiteCatalog::new();
        catalog.register(site("site-a")).unwrap();
        let id = SiteId::new("site-a");
        catalog.adjust_usage(&id, 1000, 2).unwrap();
        let record = catalog.lookup(&id).unwrap();
        assert_eq!(record.used_bytes, 1000);
        assert_eq!(record.replica_count, 2);

        catalog.adjust_usage(&id, -400, -1).unwrap();
        let record = catalog.lookup(&id).unwrap();
        assert_eq!(record.used_bytes, 600);
        assert_eq!(record.replica_count, 1);
    }

    #[test]
    fn test_adjust_usage_saturates_at_zero() {
        let mut catalog = SiteCatalog::new();
        catalog.register(site("site-a")).unwrap();
        let id = SiteId::new("site-a");
        catalog.adjust_usage(&id, -500, -5).unwrap();
        let record = catalog.lookup(&id).unwrap();
        assert_eq!(record.used_bytes, 0);
        assert_eq!(record.replica_count, 0);
    }

    #[test]
    fn test_capacity_remaining_and_fits() {
        let mut record = site("site-a");
        record.capacity_bytes = 1000;
        record.used_bytes = 700;
        assert_eq!(record.capacity_remaining(), 300);
        assert!(record.fits(300));
        assert!(!record.fits(301));
    }

    #[test]
    fn test_set_available() {
        let mut catalog = SiteCatalog::new();
        catalog.register(site("site-a")).unwrap();
        let id = SiteId::new("site-a");
        catalog.set_available(&id, false).unwrap();
        assert!(!catalog.lookup(&id).unwrap().available);
    }

    #[test]
    fn test_bandwidth_class_weights_ordered() {
        assert!(BandwidthClass::Backbone.weight() > BandwidthClass::High.weight());
        assert!(BandwidthClass::High.weight() > BandwidthClass::Standard.weight());
        assert!(BandwidthClass::Standard.weight() > BandwidthClass::Constrained.weight());
    }

    #[test]
    fn test_site_id_ordering_is_lexical() {
        let a = SiteId::new("site-a");
        let b = SiteId::new("site-b");
        assert!(a < b);
    }

    #[test]
    fn test_site_record_serde_round_trip() {
        let mut record = site("site-a");
        record.tags.insert("tier1".to_string());
        let json = serde_json::to_string(&record).unwrap();
        let back: SiteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
