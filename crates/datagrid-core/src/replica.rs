//! Replica rows and their state machine.
//!
//! A replica is one realized copy of a file at one site; there is at most
//! one row per (file, site) pair. The lock counter records how many rules
//! currently pin the replica; when it drops to zero a tombstone is set and
//! the reaper may delete the copy.

use serde::{Deserialize, Serialize};

use crate::did::Did;
use crate::site::SiteId;

/// Lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Content present and verified.
    Available,
    /// A transfer toward this site is in progress.
    Copying,
    /// Content missing or failed verification.
    Unavailable,
    /// Scheduled for deletion by the reaper.
    BeingDeleted,
}

impl ReplicaState {
    /// True if this state counts toward a rule's replica target.
    pub fn counts_toward_target(&self) -> bool {
        matches!(self, Self::Available | Self::Copying)
    }

    /// True if `next` is a legal direct transition from this state.
    pub fn can_transition_to(&self, next: ReplicaState) -> bool {
        use ReplicaState::*;
        matches!(
            (self, next),
            (Copying, Available)
                | (Copying, Unavailable)
                | (Available, Unavailable)
                | (Available, BeingDeleted)
                | (Unavailable, Copying)
                | (Unavailable, BeingDeleted)
        )
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "AVAILABLE",
            Self::Copying => "COPYING",
            Self::Unavailable => "UNAVAILABLE",
            Self::BeingDeleted => "BEING_DELETED",
        };
        f.write_str(s)
    }
}

/// One replica row: a (file, site) pair with state and accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    /// The replicated file.
    pub did: Did,
    /// The site holding (or receiving) the copy.
    pub site: SiteId,
    /// Current lifecycle state.
    pub state: ReplicaState,
    /// Size in bytes, mirrored from the file record.
    pub bytes: u64,
    /// Number of rules currently pinning this replica.
    pub lock_cnt: u32,
    /// Set when `lock_cnt` reaches zero; cleared when it rises again.
    pub tombstone_us: Option<u64>,
    /// Optimistic concurrency version, bumped on every store write.
    pub version: u64,
    /// Time of the last state change, microseconds since epoch.
    pub updated_at_us: u64,
}

impl Replica {
    /// Create a new replica row in the given state.
    pub fn new(did: Did, site: SiteId, state: ReplicaState, bytes: u64, now_us: u64) -> Self {
        Self {
            did,
            site,
            state,
            bytes,
            lock_cnt: 0,
            tombstone_us: None,
            version: 0,
            updated_at_us: now_us,
        }
    }

    /// Increment the lock counter, clearing any tombstone.
    pub fn lock(&mut self) {
        self.lock_cnt += 1;
        self.tombstone_us = None;
    }

    /// Decrement the lock counter; sets the tombstone when it reaches zero.
    /// Saturates at zero rather than underflowing.
    pub fn unlock(&mut self, now_us: u64) {
        self.lock_cnt = self.lock_cnt.saturating_sub(1);
        if self.lock_cnt == 0 {
            self.tombstone_us = Some(now_us);
        }
    }

    /// True if the replica is tombstoned, lock-free, and old enough to reap.
    pub fn reapable(&self, now_us: u64, grace_us: u64) -> bool {
        self.lock_cnt == 0
            && matches!(self.state, ReplicaState::Available | ReplicaState::Unavailable)
            && self
                .tombstone_us
                .map(|ts| now_us.saturating_sub(ts) >= grace_us)
                .unwrap_or(false)
    }
}
