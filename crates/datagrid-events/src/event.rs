//! Lifecycle events mirrored to the external bus.
//!
//! Delivery is at-least-once; consumers deduplicate on the embedded ids
//! plus timestamp. The core only produces these, it never consumes them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use datagrid_core::did::Did;
use datagrid_core::site::SiteId;

/// A structured lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A rule reached its target replica count on every file.
    RuleSatisfied {
        /// The satisfied rule.
        rule_id: Uuid,
        /// The rule's target DID.
        did: Did,
        /// Event time, microseconds since epoch.
        at_us: u64,
    },
    /// A rule cannot make progress and needs administrative attention.
    RuleStuck {
        /// The stalled rule.
        rule_id: Uuid,
        /// The rule's target DID.
        did: Did,
        /// Why the rule is stuck.
        reason: String,
        /// Event time, microseconds since epoch.
        at_us: u64,
    },
    /// A transfer request reached FAILED.
    TransferFailed {
        /// The failed request.
        request_id: Uuid,
        /// The rule the request served.
        rule_id: Uuid,
        /// The file being replicated.
        did: Did,
        /// The destination site.
        site: SiteId,
        /// Final error message.
        reason: String,
        /// Event time, microseconds since epoch.
        at_us: u64,
    },
    /// A new replica became AVAILABLE.
    ReplicaCreated {
        /// The replicated file.
        did: Did,
        /// The site now holding the copy.
        site: SiteId,
        /// Event time, microseconds since epoch.
        at_us: u64,
    },
}

impl Event {
    /// Event time in microseconds since epoch.
    pub fn at_us(&self) -> u64 {
        match self {
            Self::RuleSatisfied { at_us, .. }
            | Self::RuleStuck { at_us, .. }
            | Self::TransferFailed { at_us, .. }
            | Self::ReplicaCreated { at_us, .. } => *at_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_carries_type_tag() {
        let event = Event::ReplicaCreated {
            did: Did::new("test", "f1").unwrap(),
            site: SiteId::new("site-a"),
            at_us: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ReplicaCreated\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_at_us_accessor() {
        let event = Event::RuleStuck {
            rule_id: Uuid::new_v4(),
            did: Did::new("test", "d1").unwrap(),
            reason: "no eligible destination site".to_string(),
            at_us: 7,
        };
        assert_eq!(event.at_us(), 7);
    }
}
