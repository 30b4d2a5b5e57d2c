//! Error types for the rule engine.

use thiserror::Error;

use datagrid_core::error::IntegrityError;
use datagrid_store::StoreError;

/// Errors from rule evaluation.
#[derive(Debug, Error)]
pub enum RuleError {
    /// State store failure, including version conflicts.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A file's recorded identity blocks replica creation.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl RuleError {
    /// True for optimistic version conflicts; the caller re-reads and
    /// recomputes instead of reporting.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_detected() {
        let err = RuleError::Store(StoreError::VersionConflict {
            entity: "rule",
            key: "x".to_string(),
            expected: 1,
            found: 2,
        });
        assert!(err.is_conflict());
    }

    #[test]
    fn test_integrity_is_not_conflict() {
        let err = RuleError::Integrity(IntegrityError::ChecksumUnknown {
            did: datagrid_core::did::Did::new("test", "f1").unwrap(),
        });
        assert!(!err.is_conflict());
    }
}
