//! Discovery and garbage collection of versioned stores.

use std::sync::Arc;

use reqwest::Url;

use super::CacheStorage;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::notify::StoreDebug;

/// A store holding a readable manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentStore {
    pub name: String,
    pub version: String,
}

/// Enumerates, names, and deletes the versioned stores owned by this engine.
pub struct StoreIndex {
    storage: Arc<dyn CacheStorage>,
    prefix: String,
    manifest_key: String,
}

impl StoreIndex {
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>, config: &CacheConfig) -> Self {
        Self {
            storage,
            prefix: format!("{}-v", config.store_prefix),
            manifest_key: config.manifest_path.clone(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &dyn CacheStorage {
        self.storage.as_ref()
    }

    /// Key under which every store keeps its own manifest.
    #[must_use]
    pub fn manifest_key(&self) -> &str {
        &self.manifest_key
    }

    /// Deterministic store name for a version token. Bytes outside
    /// `[A-Za-z0-9.-]` become `_XX`, so distinct versions never share a name.
    #[must_use]
    pub fn store_name(&self, version: &str) -> String {
        let mut name = self.prefix.clone();
        for c in version.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                name.push(c);
            } else {
                let mut buf = [0; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!("_{byte:02X}"));
                }
            }
        }
        name
    }

    fn owns(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }

    /// Versioned stores, newest first. Stores of other prefixes are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    pub async fn versioned_stores(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|n| self.owns(n))
            .collect())
    }

    /// Reads the manifest embedded in a store, if present and parsable.
    pub async fn read_manifest(&self, name: &str) -> Option<Manifest> {
        let entry = match self.storage.get(name, &self.manifest_key).await {
            Ok(entry) => entry?,
            Err(e) => {
                log::warn!("Cannot read manifest of {name}: {e}");
                return None;
            }
        };
        Manifest::parse(&entry.body).ok()
    }

    /// Returns the newest store whose embedded manifest is readable.
    ///
    /// Stores without one are still being populated or were abandoned; they
    /// are skipped here and left for [`cleanup_others`](Self::cleanup_others).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    pub async fn find_current(&self) -> Result<Option<CurrentStore>> {
        for name in self.versioned_stores().await? {
            if let Some(manifest) = self.read_manifest(&name).await {
                return Ok(Some(CurrentStore {
                    name,
                    version: manifest.version,
                }));
            }
            log::debug!("Store {name} has no usable manifest");
        }
        Ok(None)
    }

    /// Deletes every versioned store not named in `keep`. Returns the deleted names.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed. Individual delete
    /// failures are logged and skipped.
    pub async fn cleanup_others(&self, keep: &[&str]) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.versioned_stores().await? {
            if keep.contains(&name.as_str()) {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(_) => {
                    log::info!("Deleted superseded store {name}");
                    deleted.push(name);
                }
                Err(e) => log::warn!("Failed to delete store {name}: {e}"),
            }
        }
        Ok(deleted)
    }

    /// Deletes every versioned store. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    pub async fn clear_all(&self) -> Result<usize> {
        Ok(self.cleanup_others(&[]).await?.len())
    }

    /// Lists every versioned store with its entry count and full URLs.
    ///
    /// # Errors
    ///
    /// Returns an error if any store cannot be read.
    pub async fn describe(&self, base: &Url) -> Result<Vec<StoreDebug>> {
        let mut out = Vec::new();
        for name in self.versioned_stores().await? {
            let keys = self.storage.keys(&name).await?;
            let urls = keys
                .iter()
                .map(|k| base.join(k).map_or_else(|_| k.clone(), String::from))
                .collect();
            out.push(StoreDebug {
                name,
                entry_count: keys.len(),
                urls,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, StoredResponse};
    use proptest::prelude::*;

    fn index() -> (Arc<MemoryStorage>, StoreIndex) {
        let storage = Arc::new(MemoryStorage::new());
        let index = StoreIndex::new(storage.clone(), &CacheConfig::default());
        (storage, index)
    }

    async fn seed(storage: &MemoryStorage, name: &str, manifest: Option<&str>) {
        storage.open(name).await.unwrap();
        if let Some(body) = manifest {
            storage
                .put(name, "/cache-manifest.json", &StoredResponse::new(200, body.to_string()))
                .await
                .unwrap();
        }
    }

    #[test]
    fn store_names_are_deterministic_and_safe() {
        let (_, index) = index();
        assert_eq!(index.store_name("2"), "mrepo-v2");
        assert_eq!(index.store_name("2"), index.store_name("2"));
        assert_eq!(index.store_name("1.4.0+build/7"), "mrepo-v1.4.0_2Bbuild_2F7");
        assert_eq!(index.store_name("é"), "mrepo-v_C3_A9");
    }

    #[test]
    fn similar_versions_get_distinct_names() {
        let (_, index) = index();
        assert_ne!(index.store_name("1/2"), index.store_name("1_2"));
        assert_ne!(index.store_name("1_2"), index.store_name("1 2"));
        assert_eq!(index.store_name("1_2"), "mrepo-v1_5F2");
    }

    #[tokio::test]
    async fn find_current_prefers_newest_valid() {
        let (storage, index) = index();
        seed(&storage, "mrepo-v1", Some(r#"{"version":"1","files":[]}"#)).await;
        seed(&storage, "mrepo-v2", Some(r#"{"version":"2","files":[]}"#)).await;

        let found = index.find_current().await.unwrap().unwrap();
        assert_eq!(found, CurrentStore { name: "mrepo-v2".into(), version: "2".into() });
    }

    #[tokio::test]
    async fn find_current_skips_unusable_stores() {
        let (storage, index) = index();
        seed(&storage, "mrepo-v1", Some(r#"{"version":"1","files":[]}"#)).await;
        seed(&storage, "mrepo-v2", None).await;
        seed(&storage, "mrepo-v3", Some("not json")).await;
        seed(&storage, "someone-else", Some(r#"{"version":"9","files":[]}"#)).await;

        let found = index.find_current().await.unwrap().unwrap();
        assert_eq!(found.version, "1");
    }

    #[tokio::test]
    async fn find_current_empty() {
        let (_, index) = index();
        assert!(index.find_current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_keeps_named_and_foreign_stores() {
        let (storage, index) = index();
        for name in ["mrepo-v1", "mrepo-v2", "mrepo-v3", "someone-else"] {
            seed(&storage, name, None).await;
        }

        let mut deleted = index.cleanup_others(&["mrepo-v2"]).await.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["mrepo-v1", "mrepo-v3"]);
        assert_eq!(storage.list().await.unwrap(), vec!["someone-else", "mrepo-v2"]);
    }

    #[tokio::test]
    async fn describe_lists_full_urls() {
        let (storage, index) = index();
        storage
            .put("mrepo-v1", "/a.js", &StoredResponse::new(200, "a"))
            .await
            .unwrap();
        let base = Url::parse("http://music.local/").unwrap();

        let stores = index.describe(&base).await.unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].entry_count, 1);
        assert_eq!(stores[0].urls, vec!["http://music.local/a.js"]);
    }

    proptest! {
        #[test]
        fn distinct_versions_never_share_a_store(a in "\\PC{0,12}", b in "\\PC{0,12}") {
            let (_, index) = index();
            let (x, y) = (index.store_name(&a), index.store_name(&b));
            prop_assert!(x.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
            prop_assert_eq!(a == b, x == y);
        }
    }
}
