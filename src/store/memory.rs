//! In-process storage backend, used for `--ephemeral` runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{CacheStorage, StoredResponse};
use crate::error::Result;

#[derive(Debug, Default)]
struct MemoryStore {
    created: u64,
    entries: BTreeMap<String, StoredResponse>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    stores: HashMap<String, MemoryStore>,
}

impl Inner {
    fn open(&mut self, name: &str) -> &mut MemoryStore {
        let seq = &mut self.next_seq;
        self.stores.entry(name.to_string()).or_insert_with(|| {
            *seq += 1;
            MemoryStore {
                created: *seq,
                entries: BTreeMap::new(),
            }
        })
    }
}

/// Stores held in memory; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn list(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut stores: Vec<_> = inner
            .stores
            .iter()
            .map(|(name, store)| (store.created, name.clone()))
            .collect();
        stores.sort_by(|a, b| b.cmp(a));
        Ok(stores.into_iter().map(|(_, name)| name).collect())
    }

    async fn open(&self, name: &str) -> Result<()> {
        self.lock().open(name);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.lock().stores.remove(name).is_some())
    }

    async fn put(&self, name: &str, key: &str, response: &StoredResponse) -> Result<()> {
        self.lock()
            .open(name)
            .entries
            .insert(key.to_string(), response.clone());
        Ok(())
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<StoredResponse>> {
        Ok(self
            .lock()
            .stores
            .get(name)
            .and_then(|s| s.entries.get(key).cloned()))
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .stores
            .get(name)
            .map(|s| s.entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}
