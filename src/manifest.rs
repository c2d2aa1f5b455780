//! The asset manifest and the fetcher that retrieves it.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::origin::{Origin, OriginRequest};
use crate::store::StoredResponse;

/// A version token plus the ordered list of asset paths it ships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(deserialize_with = "version_token")]
    pub version: String,
    pub files: Vec<String>,
}

/// Accepts `"version": "42"` as well as `"version": 42`.
fn version_token<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Token::deserialize(deserializer)? {
        Token::Text(s) => s,
        Token::Number(n) => n.to_string(),
    })
}

impl Manifest {
    #[must_use]
    pub fn new(version: impl Into<String>, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            version: version.into(),
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a manifest body. Duplicate paths are dropped, keeping the first.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a valid manifest or the version is empty.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut manifest: Self = serde_json::from_slice(body)?;
        if manifest.version.is_empty() {
            return Err(Error::Config("manifest version is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        manifest.files.retain(|f| seen.insert(f.clone()));
        Ok(manifest)
    }
}

/// Retrieves the current manifest from the origin, bypassing caches.
pub struct ManifestFetcher {
    origin: Arc<dyn Origin>,
    url: Url,
}

impl ManifestFetcher {
    /// Creates a fetcher for `manifest_path` on the given origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved against the origin.
    pub fn new(origin: Arc<dyn Origin>, manifest_path: &str) -> Result<Self> {
        let url = origin
            .base_url()
            .join(manifest_path)
            .map_err(|e| Error::InvalidUrl(format!("{manifest_path}: {e}")))?;
        Ok(Self { origin, url })
    }

    /// The manifest URL without a cache-buster.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The manifest URL with a unique `t` query parameter.
    #[must_use]
    pub fn cache_busted_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("t", &chrono::Utc::now().timestamp_millis().to_string());
        url
    }

    /// Fetches the manifest resource as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be performed.
    pub async fn fetch_raw(&self) -> Result<StoredResponse> {
        self.origin
            .fetch(OriginRequest::get(self.cache_busted_url()).bypassing_cache())
            .await
    }

    /// Fetches and parses the manifest, giving up after `timeout`.
    ///
    /// Returns `None` on any failure; callers treat that as "origin unreachable".
    pub async fn fetch(&self, timeout: Duration) -> Option<Manifest> {
        let response = match tokio::time::timeout(timeout, self.fetch_raw()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::warn!("Manifest fetch failed: {e}");
                return None;
            }
            Err(_) => {
                log::warn!("Manifest fetch timed out after {timeout:?}");
                return None;
            }
        };
        if !response.is_success() {
            log::warn!("Manifest fetch returned status {}", response.status);
            return None;
        }
        match Manifest::parse(&response.body) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("Manifest is invalid: {e}");
                None
            }
        }
    }
}
