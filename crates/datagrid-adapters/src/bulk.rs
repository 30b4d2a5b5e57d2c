//! Bulk-transfer adapter.
//!
//! GridFTP-style backend: large objects are written through several
//! parallel streams, each covering a contiguous stripe of the file. The
//! stripe writers run as separate tasks against a preallocated target so
//! wide-area latency is overlapped, then the target is renamed into place.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use datagrid_core::checksum::{Checksum, ChecksumKind};
use datagrid_core::site::ProtocolKind;

use crate::adapter::{ObjectKey, StorageAdapter};
use crate::error::AdapterError;

/// Number of parallel streams used by default.
pub const DEFAULT_STREAMS: usize = 4;
/// Objects smaller than this are written in one stream.
pub const SINGLE_STREAM_THRESHOLD: usize = 64 * 1024;

/// Filesystem-backed adapter with parallel-stream staging.
pub struct BulkAdapter {
    root: PathBuf,
    streams: usize,
}

impl BulkAdapter {
    /// Create an adapter rooted at `root` with the default stream count.
    pub fn new(root: &Path) -> Self {
        Self::with_streams(root, DEFAULT_STREAMS)
    }

    /// Create an adapter with an explicit stream count (minimum 1).
    pub fn with_streams(root: &Path, streams: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            streams: streams.max(1),
        }
    }

    fn path_for(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    async fn write_striped(&self, path: &Path, data: &Bytes) -> std::io::Result<()> {
        let file = tokio::fs::File::create(path).await?;
        file.set_len(data.len() as u64).await?;
        drop(file);

        let stripe = data.len().div_ceil(self.streams).max(1);
        let mut tasks = Vec::with_capacity(self.streams);
        for (index, chunk) in data.chunks(stripe).enumerate() {
            let offset = (index * stripe) as u64;
            let chunk = data.slice(index * stripe..index * stripe + chunk.len());
            let path = path.to_path_buf();
            tasks.push(tokio::spawn(async move {
                let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&chunk).await?;
                file.flush().await?;
                Ok::<(), std::io::Error>(())
            }));
        }
        for task in tasks {
            task.await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for BulkAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Bulk
    }

    async fn stage_in(&self, key: &ObjectKey, data: Bytes) -> Result<(), AdapterError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".stripes");
        let tmp = PathBuf::from(tmp);

        if data.len() <= SINGLE_STREAM_THRESHOLD {
            tokio::fs::write(&tmp, &data)
                .await
                .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        } else {
            self.write_striped(&tmp, &data)
                .await
                .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AdapterError::io("stage_in", key.as_str(), e))?;
        debug!(%key, bytes = data.len(), streams = self.streams, "bulk object staged");
        Ok(())
    }

    async fn stage_out(&self, key: &ObjectKey) -> Result<Bytes, AdapterError> {
        match tokio::fs::read(self.path_for(key)).await {
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
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AdapterError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(AdapterError::io("delete", key.as_str(), e)),
        }
    }

    async fn list_partials(&self) -> Result<Vec<ObjectKey>, AdapterError> {
        crate::fs::walk_partials(&self.root).await
    }

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
