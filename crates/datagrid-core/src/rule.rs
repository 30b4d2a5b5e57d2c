//! Declarative replication rules.
//!
//! A rule asks for N copies of a dataset or file on sites matching a
//! filter, until an optional expiry. The rule engine evaluates rules
//! repeatedly; a rule that cannot make progress stays PENDING with a
//! recorded stuck reason rather than being dropped.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::did::Did;
use crate::site::{SiteId, SiteRecord};

/// Lifecycle state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleState {
    /// Not yet satisfied; still being evaluated.
    Pending,
    /// Every file met its target count in one full evaluation pass.
    Satisfied,
    /// Lifetime exceeded; the rule no longer drives transfers.
    Expired,
}

impl RuleState {
    /// True if the rule no longer drives new transfers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

/// Site eligibility filter of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteFilter {
    /// Any registered site is eligible.
    Any,
    /// Only the listed sites are eligible.
    OneOf(std::collections::BTreeSet<SiteId>),
    /// Sites carrying this tag are eligible.
    Tag(String),
}

impl SiteFilter {
    /// True if `site` is eligible under this filter.
    pub fn matches(&self, site: &SiteRecord) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(set) => set.contains(&site.id),
            Self::Tag(tag) => site.tags.contains(tag),
        }
    }
}

/// A declarative replication rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier.
    pub id: Uuid,
    /// Target DID: a file or a dataset.
    pub did: Did,
    /// Desired number of replicas per file.
    pub copies: u32,
    /// Which sites are eligible destinations.
    pub filter: SiteFilter,
    /// Scheduling priority (higher is served first).
    pub priority: u32,
    /// Expiry time in microseconds since epoch, if any.
    pub expires_at_us: Option<u64>,
    /// Current lifecycle state.
    pub state: RuleState,
    /// Recorded reason when the rule cannot make progress.
    pub stuck_reason: Option<String>,
    /// Replicas this rule currently holds a lock on. Maintained by the
    /// rule engine so expiry and deletion release exactly the locks taken.
    pub locks: std::collections::BTreeSet<(Did, SiteId)>,
    /// Creation time, microseconds since epoch.
    pub created_at_us: u64,
    /// Optimistic concurrency version, bumped on every store write.
    pub version: u64,
}

impl Rule {
    /// Create a pending rule.
    pub fn new(did: Did, copies: u32, filter: SiteFilter, now_us: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            did,
            copies,
            filter,
            priority: 0,
            expires_at_us: None,
            state: RuleState::Pending,
            stuck_reason: None,
            locks: std::collections::BTreeSet::new(),
            created_at_us: now_us,
            version: 0,
        }
    }

    /// Set an expiry time.
    pub fn with_expiry(mut self, expires_at_us: u64) -> Self {
        self.expires_at_us = Some(expires_at_us);
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// True if the rule's lifetime has passed at `now_us`.
    pub fn is_expired(&self, now_us: u64) -> bool {
        self.expires_at_us.map(|ts| now_us > ts).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::ProtocolKind;

    fn did() -> Did {
        Did::new("test", "dataset.1").unwrap()
    }

    fn site(id: &str) -> SiteRecord {
        SiteRecord::new(id, ProtocolKind::ObjectStore, 1 << 30)
    }

    #[test]
    fn test_new_rule_is_pending() {
        let rule = Rule::new(did(), 2, SiteFilter::Any, 1_000);
        assert_eq!(rule.state, RuleState::Pending);
        assert_eq!(rule.copies, 2);
        assert!(rule.stuck_reason.is_none());
        assert!(!rule.is_expired(u64::MAX));
    }

    #[test]
    fn test_expiry() {
        let rule = Rule::new(did(), 1, SiteFilter::Any, 1_000).with_expiry(5_000);
        assert!(!rule.is_expired(5_000));
        assert!(rule.is_expired(5_001));
    }

    #[test]
    fn test_filter_any() {
        assert!(SiteFilter::Any.matches(&site("site-a")));
    }

    #[test]
    fn test_filter_one_of() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(SiteId::new("site-a"));
        let filter = SiteFilter::OneOf(set);
        assert!(filter.matches(&site("site-a")));
        assert!(!filter.matches(&site("site-b")));
    }

    #[test]
    fn test_filter_tag() {
        let filter = SiteFilter::Tag("tier1".to_string());
        let mut tagged = site("site-a");
        tagged.tags.insert("tier1".to_string());
        assert!(filter.matches(&tagged));
        assert!(!filter.matches(&site("site-b")));
    }

    #[test]
    fn test_only_expired_is_terminal() {
        assert!(!RuleState::Pending.is_terminal());
        assert!(!RuleState::Satisfied.is_terminal());
        assert!(RuleState::Expired.is_terminal());
    }

    #[test]
    fn test_unique_ids() {
        let a = Rule::new(did(), 1, SiteFilter::Any, 0);
        let b = Rule::new(did(), 1, SiteFilter::Any, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_builder_helpers() {
        let rule = Rule::new(did(), 1, SiteFilter::Any, 0)
            .with_priority(7)
            .with_expiry(99);
        assert_eq!(rule.priority, 7);
        assert_eq!(rule.expires_at_us, Some(99));
    }
}
