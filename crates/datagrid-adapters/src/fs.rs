//! SSH-file-transfer-style adapter.
//!
//! Backs a site with a hierarchical filesystem rooted at a directory, the
//! way an SFTP endpoint exposes a remote home. Staging writes through a
//! `.part` temporary and renames into place so a crashed transfer never
//! leaves a readable half-object under the final key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use datagrid_core::checksum::{Checksum, ChecksumKind};
use datagrid_core::site::ProtocolKind;

use crate::adapter::{ObjectKey, StorageAdapter};
use crate::error::AdapterError;

/// Walk `root` and collect keys of `.part` files, relative to `root`.
/// Shared by the filesystem-backed adapters.
pub(crate) async fn walk_partials(root: &Path) -> Result<Vec<ObjectKey>, AdapterError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(AdapterError::io("list_partials", &dir.to_string_lossy(), e)),
        };
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| AdapterError::io("list_partials", &dir.to_string_lossy(), e))?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().map(|e| e == "part").unwrap_or(false) {
                if let Ok(rel) = path.strip_prefix(root) {
                    found.push(ObjectKey::from_raw(rel.to_string_lossy().into_owned()));
                }
            }
        }
    }
    found.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(found)
}

/// Filesystem-backed adapter with SFTP-like semantics.
pub struct SshFileAdapter {
    root: PathBuf,
}

impl SshFileAdapter {
    /// Create an adapter rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path_for(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

#[async_trait]
impl StorageAdapter for SshFileAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::SshFile
    }

    async fn stage_in(&self, key: &ObjectKey, data: Bytes) -> Result<(), AdapterError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".upload");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        debug!(%key, bytes = data.len(), "file staged");
        Ok(())
    }

    async fn stage_out(&self, key: &ObjectKey) -> Result<Bytes, AdapterError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AdapterError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(AdapterError::io("stage_out", key.as_str(), e)),
        }
    }

    async fn exists(&self, key: &ObjectKey) -> Result<bool, AdapterError> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AdapterError::io("exists", key.as_str(), e)),
        }
    }

    async fn checksum(
        &self,
        key: &ObjectKey,
        kind: ChecksumKind,
    ) -> Result<Checksum, AdapterError> {
        let data = self.stage_out(key).await?;
        Ok(match kind {
            ChecksumKind::Blake3 => Checksum::blake3_of(&data),
            ChecksumKind::Sha256 => Checksum::sha256_of(&data),
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), AdapterError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AdapterError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(AdapterError::io("delete", key.as_str(), e)),
        }
    }

    async fn list_partials(&self) -> Result<Vec<ObjectKey>, AdapterError> {
        walk_partials(&self.root).await
    }

    /// Native rename; partial and final keys live on the same filesystem.
    async fn promote(&self, partial: &ObjectKey, finals: &ObjectKey) -> Result<(), AdapterError> {
        let from = self.path_for(partial);
        let to = self.path_for(finals);
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AdapterError::NotFound {
                key: partial.to_string(),
            }),
            Err(e) => Err(AdapterError::io("promote", partial.as_str(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_core::did::Did;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::for_did(&Did::new("test", name).unwrap())
    }

    #[tokio::test]
    async fn test_stage_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        adapter.stage_in(&key("f1"), Bytes::from_static(b"hello")).await.unwrap();
        assert!(adapter.exists(&key("f1")).await.unwrap());
        let data = adapter.stage_out(&key("f1")).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn test_nested_key_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        adapter
            .stage_in(&key("run2026/sub/f.dat"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(adapter.exists(&key("run2026/sub/f.dat")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        assert!(!adapter.exists(&key("ghost")).await.unwrap());
        assert!(matches!(
            adapter.stage_out(&key("ghost")).await,
            Err(AdapterError::NotFound { .. })
        ));
        assert!(matches!(
            adapter.delete(&key("ghost")).await,
            Err(AdapterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_checksum_both_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        adapter.stage_in(&key("f"), Bytes::from_static(b"abc")).await.unwrap();
        let b3 = adapter.checksum(&key("f"), ChecksumKind::Blake3).await.unwrap();
        assert!(b3.verify(b"abc"));
        let sha = adapter.checksum(&key("f"), ChecksumKind::Sha256).await.unwrap();
        assert!(sha.verify(b"abc"));
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        adapter.stage_in(&key("f"), Bytes::from_static(b"x")).await.unwrap();
        adapter.delete(&key("f")).await.unwrap();
        assert!(!adapter.exists(&key("f")).await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_renames_partial() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        let finals = key("f");
        let partial = finals.partial_of();
        adapter.stage_in(&partial, Bytes::from_static(b"abc")).await.unwrap();
        adapter.promote(&partial, &finals).await.unwrap();
        assert!(adapter.exists(&finals).await.unwrap());
        assert!(!adapter.exists(&partial).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_partials_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        adapter.stage_in(&key("done"), Bytes::from_static(b"x")).await.unwrap();
        let partial = key("run2026/pending").partial_of();
        adapter.stage_in(&partial, Bytes::from_static(b"y")).await.unwrap();
        let partials = adapter.list_partials().await.unwrap();
        assert_eq!(partials, vec![partial]);
    }

    #[tokio::test]
    async fn test_list_partials_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        assert!(adapter.list_partials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_upload_temp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SshFileAdapter::new(dir.path());
        adapter.stage_in(&key("f"), Bytes::from_static(b"x")).await.unwrap();
        let tmp = dir.path().join("test/f.upload");
        assert!(!tmp.exists());
    }
}
