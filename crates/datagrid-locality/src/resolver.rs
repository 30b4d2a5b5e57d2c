//! Source replica ranking.
//!
//! Given the sites that hold a usable replica and the transfer's
//! destination, produce a best-first ordering. The score combines
//! geographic proximity, decayed site-pair success rate, and declared
//! bandwidth class; equal scores fall back to lexical site id so the
//! ordering is deterministic under test.

use tracing::trace;

use datagrid_core::site::{SiteId, SiteRecord};

use crate::geo;
use crate::health::PairHealthTracker;

/// Weights for the ranking score components.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Weight of geographic proximity.
    pub proximity_weight: f64,
    /// Weight of observed site-pair success rate.
    pub health_weight: f64,
    /// Weight of the source's declared bandwidth class.
    pub bandwidth_weight: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            proximity_weight: 0.4,
            health_weight: 0.4,
            bandwidth_weight: 0.2,
        }
    }
}

/// Ranks candidate source sites for a transfer.
pub struct LocalityResolver {
    config: ResolverConfig,
}

impl LocalityResolver {
    /// Create a resolver with the given weights.
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Score one candidate source for a destination. Higher is better.
    pub fn score(
        &self,
        source: &SiteRecord,
        dest: &SiteRecord,
        health: &PairHealthTracker,
        now_us: u64,
    ) -> f64 {
        // Unknown coordinates rank between best and worst rather than
        // being excluded.
        let proximity = match (source.location, dest.location) {
            (Some(a), Some(b)) => geo::proximity_score(a, b),
            _ => 0.5,
        };
        let pair_rate = health.success_rate(&source.id, &dest.id, now_us);
        let bandwidth = source.bandwidth_class.weight();

        self.config.proximity_weight * proximity
            + self.config.health_weight * pair_rate
            + self.config.bandwidth_weight * bandwidth
    }

    /// Order candidate sources best-first for a transfer toward `dest`.
    /// Unavailable sites are dropped; ties break on lexical site id.
    pub fn rank_sources(
        &self,
        dest: &SiteRecord,
        candidates: &[SiteRecord],
        health: &PairHealthTracker,
        now_us: u64,
    ) -> Vec<SiteId> {
        let mut scored: Vec<(f64, SiteId)> = candidates
            .iter()
            .filter(|s| s.available && s.id != dest.id)
            .map(|s| {
                let score = self.score(s, dest, health, now_us);
                trace!(source = %s.id, dest = %dest.id, score, "ranked source");
                (score, s.id.clone())
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.into_iter().map(|(_, id)| id).collect()
    }
}

impl Default for LocalityResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}
