//! Decaying per-site-pair transfer health.
//!
//! Each (source, destination) pair keeps exponentially decaying success
//! and failure counters. Old outcomes fade with a configurable half-life,
//! so a site that was broken yesterday but healthy for the last hour ranks
//! close to clean again.

use std::collections::HashMap;

use datagrid_core::site::SiteId;

/// Default half-life for outcome decay: 30 minutes.
pub const DEFAULT_HALF_LIFE_US: u64 = 30 * 60 * 1_000_000;

/// Decaying outcome counters for one site pair.
#[derive(Debug, Clone)]
pub struct PairHealth {
    successes: f64,
    failures: f64,
    last_update_us: u64,
}

impl PairHealth {
    fn new(now_us: u64) -> Self {
        Self {
            successes: 0.0,
            failures: 0.0,
            last_update_us: now_us,
        }
    }

    fn decay(&mut self, now_us: u64, half_life_us: u64) {
        let elapsed = now_us.saturating_sub(self.last_update_us);
        if elapsed == 0 {
            return;
        }
        let factor = 0.5f64.powf(elapsed as f64 / half_life_us as f64);
        self.successes *= factor;
        self.failures *= factor;
        self.last_update_us = now_us;
    }

    /// Smoothed success rate in (0, 1); an unobserved pair reports 0.5.
    pub fn success_rate(&self) -> f64 {
        (self.successes + 1.0) / (self.successes + self.failures + 2.0)
    }
}

/// Tracks health for all observed site pairs.
pub struct PairHealthTracker {
    half_life_us: u64,
    pairs: HashMap<(SiteId, SiteId), PairHealth>,
}

impl PairHealthTracker {
    /// Create a tracker with the default half-life.
    pub fn new() -> Self {
        Self::with_half_life(DEFAULT_HALF_LIFE_US)
    }

    /// Create a tracker with an explicit half-life in microseconds.
    pub fn with_half_life(half_life_us: u64) -> Self {
        Self {
            half_life_us: half_life_us.max(1),
            pairs: HashMap::new(),
        }
    }

    /// Record a successful transfer from `source` to `dest`.
    pub fn record_success(&mut self, source: &SiteId, dest: &SiteId, now_us: u64) {
        let entry = self
            .pairs
            .entry((source.clone(), dest.clone()))
            .or_insert_with(|| PairHealth::new(now_us));
        entry.decay(now_us, self.half_life_us);
        entry.successes += 1.0;
    }

    /// Record a failed transfer from `source` to `dest`.
    pub fn record_failure(&mut self, source: &SiteId, dest: &SiteId, now_us: u64) {
        let entry = self
            .pairs
            .entry((source.clone(), dest.clone()))
            .or_insert_with(|| PairHealth::new(now_us));
        entry.decay(now_us, self.half_life_us);
        entry.failures += 1.0;
    }

    /// Current success rate for a pair; 0.5 for unobserved pairs.
    pub fn success_rate(&self, source: &SiteId, dest: &SiteId, now_us: u64) -> f64 {
        match self.pairs.get(&(source.clone(), dest.clone())) {
            Some(health) => {
                let mut h = health.clone();
                h.decay(now_us, self.half_life_us);
                h.success_rate()
            }
            None => 0.5,
        }
    }

    /// Number of pairs with recorded outcomes.
    pub fn observed_pairs(&self) -> usize {
        self.pairs.len()
    }
}

impl Default for PairHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
