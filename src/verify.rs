//! Checks that an existing store still holds every file its manifest lists.

use std::collections::HashSet;
use std::sync::Arc;

use reqwest::Url;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::store::{StoreIndex, entry_key, path_only};

pub struct IntegrityVerifier {
    index: Arc<StoreIndex>,
    base: Url,
}

impl IntegrityVerifier {
    #[must_use]
    pub const fn new(index: Arc<StoreIndex>, base: Url) -> Self {
        Self { index, base }
    }

    /// Manifest paths with no entry in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store's keys cannot be listed.
    pub async fn missing(&self, store: &str, manifest: &Manifest) -> Result<Vec<String>> {
        let present: HashSet<String> = self
            .index
            .storage()
            .keys(store)
            .await?
            .iter()
            .map(|k| path_only(k).to_string())
            .collect();

        Ok(manifest
            .files
            .iter()
            .filter(|file| {
                entry_key(&self.base, file)
                    .is_none_or(|key| !present.contains(path_only(&key)))
            })
            .cloned()
            .collect())
    }

    /// True if every manifest path is present in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store's keys cannot be listed.
    pub async fn verify(&self, store: &str, manifest: &Manifest) -> Result<bool> {
        let missing = self.missing(store, manifest).await?;
        if !missing.is_empty() {
            log::warn!(
                "Store {store} is missing {} of {} file(s), e.g. {}",
                missing.len(),
                manifest.files.len(),
                missing[0]
            );
        }
        Ok(missing.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::{CacheStorage, MemoryStorage, StoredResponse};

    async fn verifier_with(keys: &[&str]) -> IntegrityVerifier {
        let storage = Arc::new(MemoryStorage::new());
        for key in keys {
            storage
                .put("mrepo-v1", key, &StoredResponse::new(200, "x"))
                .await
                .unwrap();
        }
        let index = Arc::new(StoreIndex::new(storage, &CacheConfig::default()));
        IntegrityVerifier::new(index, Url::parse("http://origin.test/").unwrap())
    }

    #[tokio::test]
    async fn complete_store_verifies() {
        let verifier = verifier_with(&["/a.js", "/b.css", "/cache-manifest.json"]).await;
        let manifest = Manifest::new("1", ["/a.js", "b.css"]);
        assert!(verifier.verify("mrepo-v1", &manifest).await.unwrap());
    }

    #[tokio::test]
    async fn incomplete_store_fails() {
        let verifier = verifier_with(&["/a.js"]).await;
        let manifest = Manifest::new("1", ["/a.js", "/b.css"]);
        assert!(!verifier.verify("mrepo-v1", &manifest).await.unwrap());
        assert_eq!(
            verifier.missing("mrepo-v1", &manifest).await.unwrap(),
            vec!["/b.css"]
        );
    }

    #[tokio::test]
    async fn query_keys_count_by_path() {
        let verifier = verifier_with(&["/a.js?v=9"]).await;
        let manifest = Manifest::new("1", ["/a.js"]);
        assert!(verifier.verify("mrepo-v1", &manifest).await.unwrap());
    }

    #[tokio::test]
    async fn missing_store_fails() {
        let verifier = verifier_with(&[]).await;
        let manifest = Manifest::new("1", ["/a.js"]);
        assert!(!verifier.verify("mrepo-v9", &manifest).await.unwrap());
    }
}
