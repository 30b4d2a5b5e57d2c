//! Per-site adapter registry.
//!
//! Adapters are registered per site at orchestrator construction time,
//! keyed by the site's declared protocol; lookup never inspects types at
//! runtime. Registering an adapter whose protocol disagrees with the
//! site's declaration is rejected.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use datagrid_core::site::{ProtocolKind, SiteId, SiteRecord};

use crate::adapter::StorageAdapter;

/// Errors from registry construction and lookup.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    /// A site was registered twice.
    #[error("adapter for site {site} is already registered")]
    AlreadyRegistered {
        /// The offending site id.
        site: SiteId,
    },
    /// The adapter's protocol does not match the site's declaration.
    #[error("site {site} declares {declared:?} but adapter speaks {actual:?}")]
    ProtocolMismatch {
        /// The offending site id.
        site: SiteId,
        /// Protocol in the site record.
        declared: ProtocolKind,
        /// Protocol implemented by the adapter.
        actual: ProtocolKind,
    },
    /// No adapter registered for the site.
    #[error("no adapter registered for site {site}")]
    NotRegistered {
        /// The missing site id.
        site: SiteId,
    },
}

/// Maps each site to the adapter implementing its declared protocol.
pub struct AdapterRegistry {
    adapters: HashMap<SiteId, Arc<dyn StorageAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter for a site, checking the protocol declaration.
    pub fn register(
        &mut self,
        site: &SiteRecord,
        adapter: Arc<dyn StorageAdapter>,
    ) -> Result<(), RegistryError> {
        if adapter.protocol() != site.protocol {
            return Err(RegistryError::ProtocolMismatch {
                site: site.id.clone(),
                declared: site.protocol,
                actual: adapter.protocol(),
            });
        }
        if self.adapters.contains_key(&site.id) {
            return Err(RegistryError::AlreadyRegistered {
                site: site.id.clone(),
            });
        }
        self.adapters.insert(site.id.clone(), adapter);
        Ok(())
    }

    /// Look up the adapter for a site.
    pub fn for_site(&self, site: &SiteId) -> Result<Arc<dyn StorageAdapter>, RegistryError> {
        self.adapters
            .get(site)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered { site: site.clone() })
    }

    /// Number of registered sites.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// True if no adapters are registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
