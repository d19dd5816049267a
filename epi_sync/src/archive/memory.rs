//! In-process archive. Nothing survives the process; used by tests and by
//! `backend = "memory"`.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::model::Generation;

use super::{ArchiveEntry, ArchiveKey, ArchiveStore, StorageError};

/// Archive held in a map keyed by generation.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    entries: Mutex<BTreeMap<Generation, (ArchiveKey, Vec<u8>)>>,
}

impl MemoryArchiveStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Generation, (ArchiveKey, Vec<u8>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn put(&self, key: &ArchiveKey, blob: Vec<u8>) -> Result<ArchiveEntry, StorageError> {
        let byte_len = blob.len() as u64;
        self.lock().insert(key.generation(), (*key, blob));
        Ok(ArchiveEntry {
            key: *key,
            byte_len,
        })
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .lock()
            .get(&key.generation())
            .filter(|(stored, _)| stored == key)
            .map(|(_, blob)| blob.clone()))
    }

    async fn list(&self) -> Result<Vec<ArchiveEntry>, StorageError> {
        Ok(self
            .lock()
            .values()
            .map(|(key, blob)| ArchiveEntry {
                key: *key,
                byte_len: blob.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StorageError> {
        let mut entries = self.lock();
        match entries.get(&key.generation()) {
            Some((stored, _)) if stored == key => {
                entries.remove(&key.generation());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
