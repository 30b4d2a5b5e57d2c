//! Transfer requests.
//!
//! A transfer request is one trackable unit of work: create one replica of
//! one file at one destination site on behalf of one rule. The rule engine
//! creates requests; the orchestrator owns them from then on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::did::Did;
use crate::site::SiteId;

/// Lifecycle state of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Waiting for admission to the destination site.
    Queued,
    /// Admitted; a worker is preparing the transfer.
    Submitted,
    /// Bytes are moving.
    Copying,
    /// Replica created and verified.
    Done,
    /// Terminally failed (retry budget exhausted or permanent error).
    Failed,
    /// Cancelled before completion (rule deleted or expired).
    Cancelled,
}

impl TransferState {
    /// True for states that will never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// True for states that occupy a slot at the destination site.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Submitted | Self::Copying)
    }

    /// True for states that already count toward a file's shortfall, so the
    /// rule engine must not emit another request for the same destination.
    pub fn counts_toward_shortfall(&self) -> bool {
        matches!(self, Self::Queued | Self::Submitted | Self::Copying)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Submitted => "SUBMITTED",
            Self::Copying => "COPYING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A concrete request to create one replica at one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Unique request identifier.
    pub id: Uuid,
    /// The file to replicate.
    pub did: Did,
    /// Destination site.
    pub dest: SiteId,
    /// The rule this request serves.
    pub rule_id: Uuid,
    /// Candidate source sites, ranked best-first at submission time.
    pub sources: Vec<SiteId>,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Current lifecycle state.
    pub state: TransferState,
    /// Scheduling priority inherited from the rule.
    pub priority: u32,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
    /// Creation time, microseconds since epoch.
    pub created_at_us: u64,
    /// Time of the last state change, microseconds since epoch.
    pub updated_at_us: u64,
    /// Optimistic concurrency version, bumped on every store write.
    pub version: u64,
}

impl TransferRequest {
    /// Create a queued request.
    pub fn new(did: Did, dest: SiteId, rule_id: Uuid, priority: u32, now_us: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            did,
            dest,
            rule_id,
            sources: Vec::new(),
            attempts: 0,
            state: TransferState::Queued,
            priority,
            last_error: None,
            created_at_us: now_us,
            updated_at_us: now_us,
            version: 0,
        }
    }

    /// Deduplication key: the rule engine never creates two live requests
    /// with the same key.
    pub fn dedup_key(&self) -> (Did, SiteId, Uuid) {
        (self.did.clone(), self.dest.clone(), self.rule_id)
    }
}
