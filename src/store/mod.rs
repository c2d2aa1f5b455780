//! Persistent, named, versioned asset stores.
//!
//! A store is a flat map from normalized entry key to a stored response.
//! Backends implement [`CacheStorage`]; [`StoreIndex`] layers version
//! discovery and garbage collection on top.

mod disk;
mod index;
mod key;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use disk::DiskStorage;
pub use index::{CurrentStore, StoreIndex};
pub use key::{entry_key, key_of, path_only};
pub use memory::MemoryStorage;

/// Response headers that describe a single connection rather than the resource.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Returns true if the header must not be stored or forwarded.
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A response as held in a store: status, headers, and the exact body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StoredResponse {
    /// Creates a response with no headers.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first value of a header, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Synthetic 503 used when neither the store nor the network can answer.
    #[must_use]
    pub fn service_unavailable(path: &str) -> Self {
        Self::new(503, format!("Service unavailable (offline): {path}"))
            .with_header("content-type", "text/plain; charset=utf-8")
    }
}

/// Storage backend holding any number of named stores.
///
/// Every operation on a store that does not exist behaves as if the store
/// were empty, except [`put`](Self::put), which creates it.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Lists store names, most recently created first.
    async fn list(&self) -> Result<Vec<String>>;

    /// Creates the store if it does not exist yet.
    async fn open(&self, name: &str) -> Result<()>;

    /// Deletes a store. Returns false if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Writes an entry, creating the store if needed.
    async fn put(&self, name: &str, key: &str, response: &StoredResponse) -> Result<()>;

    /// Reads an entry.
    async fn get(&self, name: &str, key: &str) -> Result<Option<StoredResponse>>;

    /// Lists every entry key in a store.
    async fn keys(&self, name: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        assert!(StoredResponse::new(200, "").is_success());
        assert!(StoredResponse::new(204, "").is_success());
        assert!(!StoredResponse::new(304, "").is_success());
        assert!(!StoredResponse::new(404, "").is_success());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = StoredResponse::new(200, "x").with_header("Content-Type", "text/css");
        assert_eq!(resp.header("content-type"), Some("text/css"));
        assert_eq!(resp.header("etag"), None);
    }

    #[test]
    fn service_unavailable_names_path() {
        let resp = StoredResponse::service_unavailable("/assets/app.js");
        assert_eq!(resp.status, 503);
        assert!(String::from_utf8_lossy(&resp.body).contains("/assets/app.js"));
    }

    #[test]
    fn hop_by_hop_headers() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("etag"));
    }
}
