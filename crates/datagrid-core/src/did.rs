//! Scoped data identifiers.
//!
//! Every file and dataset is addressed by a `scope:name` pair. The scope
//! partitions the namespace by owning account or activity; the name is
//! unique within its scope. Once a DID is recorded with a size and
//! checksum, that identity never changes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length accepted for a scope.
pub const MAX_SCOPE_LEN: usize = 25;
/// Maximum length accepted for a name.
pub const MAX_NAME_LEN: usize = 255;

/// Errors from DID construction and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DidError {
    /// Scope is empty or too long, or contains a separator.
    #[error("invalid scope: {reason}")]
    InvalidScope {
        /// Why the scope was rejected.
        reason: String,
    },
    /// Name is empty or too long.
    #[error("invalid name: {reason}")]
    InvalidName {
        /// Why the name was rejected.
        reason: String,
    },
    /// String form did not contain a `scope:name` separator.
    #[error("malformed DID {input:?}: expected scope:name")]
    Malformed {
        /// The rejected input.
        input: String,
    },
}

/// A scoped data identifier (`scope:name`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Did {
    scope: String,
    name: String,
}

impl Did {
    /// Construct a DID from a scope and a name, validating both parts.
    pub fn new(scope: &str, name: &str) -> Result<Self, DidError> {
        if scope.is_empty() {
            return Err(DidError::InvalidScope {
                reason: "empty".to_string(),
            });
        }
        if scope.len() > MAX_SCOPE_LEN {
            return Err(DidError::InvalidScope {
                reason: format!("longer than {} bytes", MAX_SCOPE_LEN),
            });
        }
        if scope.contains(':') {
            return Err(DidError::InvalidScope {
                reason: "contains ':'".to_string(),
            });
        }
        if name.is_empty() {
            return Err(DidError::InvalidName {
                reason: "empty".to_string(),
            });
        }
        if name.len() > MAX_NAME_LEN {
            return Err(DidError::InvalidName {
                reason: format!("longer than {} bytes", MAX_NAME_LEN),
            });
        }
        Ok(Self {
            scope: scope.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse a DID from its `scope:name` string form.
    pub fn parse(input: &str) -> Result<Self, DidError> {
        match input.split_once(':') {
            Some((scope, name)) => Self::new(scope, name),
            None => Err(DidError::Malformed {
                input: input.to_string(),
            }),
        }
    }

    /// The scope part.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The name part.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Did {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}
