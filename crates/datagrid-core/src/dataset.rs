//! Datasets and file records.
//!
//! A file record fixes the size and (once known) checksum of a file DID.
//! A dataset is a named collection of file DIDs; membership can grow while
//! the dataset is open and is immutable once it is closed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::Checksum;
use crate::did::Did;

/// Durable record of a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// The file's data identifier.
    pub did: Did,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Content checksum; `None` until first established.
    pub checksum: Option<Checksum>,
}

impl FileRecord {
    /// Create a file record without a known checksum.
    pub fn new(did: Did, size_bytes: u64) -> Self {
        Self {
            did,
            size_bytes,
            checksum: None,
        }
    }

    /// Create a file record with a known checksum.
    pub fn with_checksum(did: Did, size_bytes: u64, checksum: Checksum) -> Self {
        Self {
            did,
            size_bytes,
            checksum: Some(checksum),
        }
    }
}

/// Errors from dataset mutation.
#[derive(Debug, Error, PartialEq)]
pub enum DatasetError {
    /// Attach attempted on a closed dataset.
    #[error("dataset {did} is closed; membership is immutable")]
    Closed {
        /// The dataset's identifier.
        did: Did,
    },
    /// The file is already a member.
    #[error("file {file} is already attached to dataset {dataset}")]
    AlreadyAttached {
        /// The dataset's identifier.
        dataset: Did,
        /// The duplicate file identifier.
        file: Did,
    },
}

/// A named collection of files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// The dataset's own data identifier.
    pub did: Did,
    /// True while files may still be attached.
    pub open: bool,
    /// Member file identifiers, in sorted order.
    pub files: BTreeSet<Did>,
    /// Sum of member file sizes in bytes.
    pub total_bytes: u64,
}

impl Dataset {
    /// Create a new, open, empty dataset.
    pub fn new(did: Did) -> Self {
        Self {
            did,
            open: true,
            files: BTreeSet::new(),
            total_bytes: 0,
        }
    }

    /// Attach a file to the dataset.
    pub fn attach(&mut self, file: Did, size_bytes: u64) -> Result<(), DatasetError> {
        if !self.open {
            return Err(DatasetError::Closed {
                did: self.did.clone(),
            });
        }
        if !self.files.insert(file.clone()) {
            return Err(DatasetError::AlreadyAttached {
                dataset: self.did.clone(),
                file,
            });
        }
        self.total_bytes = self.total_bytes.saturating_add(size_bytes);
        Ok(())
    }

    /// Close the dataset; membership becomes immutable.
    pub fn close(&mut self) {
        self.open = false;
    }

    /// Number of member files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if the dataset has no members.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
