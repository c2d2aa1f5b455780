//! Downloads a manifest's asset set into a fresh versioned store.

use std::sync::Arc;

use futures::{StreamExt, stream};
use reqwest::Url;

use crate::error::{Error, FileError, Result};
use crate::manifest::{Manifest, ManifestFetcher};
use crate::notify::{CacheStatus, Notifier, Status};
use crate::origin::{Origin, OriginRequest};
use crate::store::{StoreIndex, entry_key};
use crate::verify::IntegrityVerifier;

/// Builds new versioned stores, all-or-nothing.
pub struct Populator {
    origin: Arc<dyn Origin>,
    index: Arc<StoreIndex>,
    fetcher: Arc<ManifestFetcher>,
    verifier: IntegrityVerifier,
    batch_size: usize,
}

impl Populator {
    #[must_use]
    pub fn new(
        origin: Arc<dyn Origin>,
        index: Arc<StoreIndex>,
        fetcher: Arc<ManifestFetcher>,
        batch_size: usize,
    ) -> Self {
        let verifier = IntegrityVerifier::new(Arc::clone(&index), origin.base_url().clone());
        Self {
            origin,
            index,
            fetcher,
            verifier,
            batch_size: batch_size.max(1),
        }
    }

    /// Downloads every file in `manifest` plus the manifest itself into the
    /// store named after its version, and returns that name.
    ///
    /// Files are fetched in batches of `batch_size`; a batch starts only after
    /// the previous one has been written. Progress is broadcast after each
    /// batch. The finished store is checked against the manifest once more,
    /// since entries may vanish while it is written. If any file fails or is
    /// missing at the end, the store is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Population`] listing every failed file.
    pub async fn populate(&self, manifest: &Manifest, notifier: &Notifier) -> Result<String> {
        let name = self.index.store_name(&manifest.version);
        let storage = self.index.storage();

        if storage.delete(&name).await? {
            log::warn!("Discarded leftover store {name} before repopulating");
        }
        storage.open(&name).await?;

        let total = manifest.files.len();
        log::info!("Populating {name} with {total} file(s)");

        let mut errors = Vec::new();
        let mut processed = 0;
        for batch in manifest.files.chunks(self.batch_size) {
            let results: Vec<_> = stream::iter(batch.iter().cloned())
                .map(|path| self.cache_file(name.clone(), path))
                .buffer_unordered(self.batch_size)
                .collect()
                .await;

            errors.extend(results.into_iter().filter_map(std::result::Result::err));
            processed += batch.len();
            notifier.status(
                CacheStatus::new(Status::Caching)
                    .with_progress(processed, total)
                    .with_version(Some(&manifest.version)),
            );
        }

        if let Err(e) = self.store_manifest(&name, manifest).await {
            errors.push(FileError {
                path: self.index.manifest_key().to_string(),
                error: e.to_string(),
            });
        }

        if errors.is_empty() {
            errors = self.check_complete(&name, manifest).await;
        }
        if errors.is_empty() {
            log::info!("Populated {name}");
            return Ok(name);
        }

        for e in &errors {
            log::error!("Failed to cache {}: {}", e.path, e.error);
        }
        if let Err(e) = storage.delete(&name).await {
            log::error!("Failed to discard partial store {name}: {e}");
        }
        Err(Error::Population {
            store: name,
            errors,
        })
    }

    async fn cache_file(&self, store: String, path: String) -> std::result::Result<(), FileError> {
        self.store_file(&store, &path)
            .await
            .map_err(|e| FileError {
                path,
                error: e.to_string(),
            })
    }

    /// Entries that are not in the store after every write reported success.
    async fn check_complete(&self, store: &str, manifest: &Manifest) -> Vec<FileError> {
        let mut errors: Vec<FileError> = match self.verifier.missing(store, manifest).await {
            Ok(missing) => missing
                .into_iter()
                .map(|path| FileError {
                    path,
                    error: "missing from store after population".to_string(),
                })
                .collect(),
            Err(e) => vec![FileError {
                path: store.to_string(),
                error: e.to_string(),
            }],
        };
        let manifest_ok = self
            .index
            .read_manifest(store)
            .await
            .is_some_and(|m| m.version == manifest.version);
        if !manifest_ok {
            errors.push(FileError {
                path: self.index.manifest_key().to_string(),
                error: "missing from store after population".to_string(),
            });
        }
        errors
    }

    async fn store_file(&self, store: &str, path: &str) -> Result<()> {
        let base = self.origin.base_url();
        let key = entry_key(base, path)
            .ok_or_else(|| Error::InvalidUrl(format!("{path} is not on {base}")))?;
        let url = resolve(base, path)?;

        let response = self
            .origin
            .fetch(OriginRequest::get(url.clone()).bypassing_cache())
            .await?;
        if !response.is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        self.index.storage().put(store, &key, &response).await
    }

    /// The manifest is a required entry: it marks the store as usable.
    async fn store_manifest(&self, store: &str, expected: &Manifest) -> Result<()> {
        let response = self.fetcher.fetch_raw().await?;
        if !response.is_success() {
            return Err(Error::Status {
                url: self.fetcher.url().to_string(),
                status: response.status,
            });
        }
        let fetched = Manifest::parse(&response.body)?;
        if fetched.version != expected.version {
            return Err(Error::Config(format!(
                "manifest changed to version {} during population",
                fetched.version
            )));
        }
        self.index
            .storage()
            .put(store, self.index.manifest_key(), &response)
            .await
    }
}

fn resolve(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::InvalidUrl(format!("{path}: {e}")))
}
