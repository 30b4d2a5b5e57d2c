//! Object-store adapter.
//!
//! A flat-namespace object backend with quota enforcement, used both as
//! the reference implementation of the adapter contract and as the test
//! backend for the orchestrator. A fault plan can be scripted onto it to
//! exercise the retry and rollback paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use datagrid_core::checksum::{Checksum, ChecksumKind};
use datagrid_core::site::ProtocolKind;

use crate::adapter::{ObjectKey, StorageAdapter};
use crate::error::AdapterError;

/// A scripted fault: returned instead of executing the next matching call.
#[derive(Debug)]
pub enum Fault {
    /// Fail the next operation with a timeout.
    Timeout,
    /// Fail the next operation with a connection reset.
    ConnectionReset,
    /// Fail the next operation with a rate-limit response.
    RateLimited,
    /// Corrupt staged data (stage_in stores flipped bytes instead).
    CorruptOnWrite,
}

/// In-memory object store with quota enforcement and scripted faults.
pub struct ObjectStoreAdapter {
    objects: DashMap<String, Bytes>,
    quota_bytes: u64,
    used_bytes: AtomicU64,
    faults: Mutex<VecDeque<Fault>>,
}

impl ObjectStoreAdapter {
    /// Create an adapter with the given quota.
    pub fn new(quota_bytes: u64) -> Self {
        Self {
            objects: DashMap::new(),
            quota_bytes,
            used_bytes: AtomicU64::new(0),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a fault for the next adapter operation.
    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Bytes currently stored.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn take_fault(&self) -> Option<Fault> {
        self.faults.lock().ok().and_then(|mut f| f.pop_front())
    }

    fn check_fault(&self, op: &'static str, key: &ObjectKey) -> Result<Option<Fault>, AdapterError> {
        match self.take_fault() {
            Some(Fault::Timeout) => Err(AdapterError::Timeout {
                op,
                key: key.to_string(),
            }),
            Some(Fault::ConnectionReset) => Err(AdapterError::ConnectionReset {
                op,
                key: key.to_string(),
            }),
            Some(Fault::RateLimited) => Err(AdapterError::RateLimited {
                op,
                key: key.to_string(),
            }),
            Some(fault @ Fault::CorruptOnWrite) => Ok(Some(fault)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StorageAdapter for ObjectStoreAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::ObjectStore
    }

    async fn stage_in(&self, key: &ObjectKey, data: Bytes) -> Result<(), AdapterError> {
        let fault = self.check_fault("stage_in", key)?;

        let incoming = data.len() as u64;
        let replaced = self
            .objects
            .get(key.as_str())
            .map(|e| e.value().len() as u64)
            .unwrap_or(0);
        let used = self.used_bytes.load(Ordering::SeqCst);
        let projected = used.saturating_sub(replaced).saturating_add(incoming);
        if projected > self.quota_bytes {
            return Err(AdapterError::QuotaExceeded {
                key: key.to_string(),
                needed: incoming,
                available: self.quota_bytes.saturating_sub(used.saturating_sub(replaced)),
            });
        }

        let stored = if matches!(fault, Some(Fault::CorruptOnWrite)) {
            let mut corrupted: Vec<u8> = data.to_vec();
            if let Some(first) = corrupted.first_mut() {
                *first ^= 0xFF;
            } else {
                corrupted.push(0xFF);
            }
            Bytes::from(corrupted)
        } else {
            data
        };

        let stored_len = stored.len() as u64;
        self.objects.insert(key.as_str().to_string(), stored);
        self.used_bytes
            .store(projected.saturating_sub(incoming).saturating_add(stored_len), Ordering::SeqCst);
        debug!(%key, bytes = stored_len, "object staged");
        Ok(())
    }

    async fn stage_out(&self, key: &ObjectKey) -> Result<Bytes, AdapterError> {
        self.check_fault("stage_out", key)?;
        self.objects
            .get(key.as_str())
            .map(|e| e.value().clone())
            .ok_or_else(|| AdapterError::NotFound {
                key: key.to_string(),
            })
    }

    async fn exists(&self, key: &ObjectKey) -> Result<bool, AdapterError> {
        self.check_fault("exists", key)?;
        Ok(self.objects.contains_key(key.as_str()))
    }

    async fn checksum(
        &self,
        key: &ObjectKey,
        kind: ChecksumKind,
    ) -> Result<Checksum, AdapterError> {
        self.check_fault("checksum", key)?;
        let data = self
            .objects
            .get(key.as_str())
            .map(|e| e.value().clone())
            .ok_or_else(|| AdapterError::NotFound {
                key: key.to_string(),
            })?;
        Ok(match kind {
            ChecksumKind::Blake3 => Checksum::blake3_of(&data),
            ChecksumKind::Sha256 => Checksum::sha256_of(&data),
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), AdapterError> {
        self.check_fault("delete", key)?;
        let (_, removed) =
            self.objects
                .remove(key.as_str())
                .ok_or_else(|| AdapterError::NotFound {
                    key: key.to_string(),
                })?;
        self.used_bytes
            .fetch_sub(removed.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn list_partials(&self) -> Result<Vec<ObjectKey>, AdapterError> {
        let mut out: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|e| e.key().ends_with(".part"))
            .map(|e| ObjectKey::from_raw(e.key().clone()))
            .collect();
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(out)
    }
}
