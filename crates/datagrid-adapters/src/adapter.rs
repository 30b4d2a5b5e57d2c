//! The storage adapter capability contract.
//!
//! One implementation exists per supported protocol; a site's declared
//! protocol selects the implementation when the orchestrator is built. No
//! adapter may block the scheduling loop: every operation is async and the
//! orchestrator only awaits them from worker tasks.

use async_trait::async_trait;
use bytes::Bytes;

use datagrid_core::checksum::{Checksum, ChecksumKind};
use datagrid_core::did::Did;
use datagrid_core::site::ProtocolKind;

use crate::error::AdapterError;

/// Storage-side key of an object, derived from its DID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Key for a file DID: `scope/name`.
    pub fn for_did(did: &Did) -> Self {
        Self(format!("{}/{}", did.scope(), did.name()))
    }

    /// Key for an in-progress upload of the same DID; staged content lives
    /// here until verified, so a crash never leaves a half-written object
    /// under the final key.
    pub fn partial_of(&self) -> Self {
        Self(format!("{}.part", self.0))
    }

    /// True if this key names an in-progress upload.
    pub fn is_partial(&self) -> bool {
        self.0.ends_with(".part")
    }

    /// Key from its storage-side string form, as reported by a backend
    /// listing.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The final key a partial belongs to; `None` for a non-partial key.
    pub fn final_of(&self) -> Option<ObjectKey> {
        self.0.strip_suffix(".part").map(|s| Self(s.to_string()))
    }

    /// The DID a final key encodes, if it parses back.
    pub fn to_did(&self) -> Option<Did> {
        let (scope, name) = self.0.split_once('/')?;
        Did::new(scope, name).ok()
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability contract over one storage backend.
///
/// All four capabilities of the protocol layer are here: staging (both
/// directions), existence check, checksum, and delete. Implementations
/// must classify every failure through [`AdapterError::class`].
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Protocol this adapter implements.
    fn protocol(&self) -> ProtocolKind;

    /// Write an object to this site under `key`.
    async fn stage_in(&self, key: &ObjectKey, data: Bytes) -> Result<(), AdapterError>;

    /// Read an object from this site.
    async fn stage_out(&self, key: &ObjectKey) -> Result<Bytes, AdapterError>;

    /// True if an object exists under `key`.
    async fn exists(&self, key: &ObjectKey) -> Result<bool, AdapterError>;

    /// Compute the checksum of the object under `key`.
    async fn checksum(&self, key: &ObjectKey, kind: ChecksumKind) -> Result<Checksum, AdapterError>;

    /// Delete the object under `key`. Deleting a missing object is an
    /// error (`NotFound`), so callers can distinguish "already gone".
    async fn delete(&self, key: &ObjectKey) -> Result<(), AdapterError>;

    /// Keys of in-progress uploads present at this site. Input to the
    /// reaper's orphan sweep.
    async fn list_partials(&self) -> Result<Vec<ObjectKey>, AdapterError>;

    /// Rename a staged partial object to its final key. The default
    /// implementation copies and deletes; backends with a native rename
    /// override it.
    async fn promote(&self, partial: &ObjectKey, finals: &ObjectKey) -> Result<(), AdapterError> {
        let data = self.stage_out(partial).await?;
        self.stage_in(finals, data).await?;
        self.delete(partial).await
    }
}
