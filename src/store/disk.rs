//! On-disk storage backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! <store-name>/store.json               descriptor (name, creation time)
//! <store-name>/entries/<sha256>.json    entry metadata (key, status, headers)
//! <store-name>/entries/<sha256>.body    entry body
//! ```
//!
//! Files are written to a temporary path and renamed into place, and the
//! metadata file is written after the body, so a reader never sees a
//! metadata file without its complete body.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CacheStorage, StoredResponse};
use crate::error::{Error, Result};

const DESCRIPTOR: &str = "store.json";
const ENTRIES: &str = "entries";

#[derive(Debug, Serialize, Deserialize)]
struct StoreDescriptor {
    name: String,
    created: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
}

/// Stores kept as directories under a root path.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(self.root.join(name))
        } else {
            Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid store name: {name:?}"),
            )))
        }
    }

    fn entry_paths(store_dir: &Path, key: &str) -> (PathBuf, PathBuf) {
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        let dir = store_dir.join(ENTRIES);
        (
            dir.join(format!("{digest}.json")),
            dir.join(format!("{digest}.body")),
        )
    }

    async fn read_descriptor(dir: &Path) -> Option<StoreDescriptor> {
        let raw = tokio::fs::read(dir.join(DESCRIPTOR)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

/// Writes `contents` to a sibling temp file and renames it over `path`.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn list(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut stores = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // A directory without a readable descriptor sorts last so GC reaches it.
            let created = Self::read_descriptor(&entry.path())
                .await
                .map_or(DateTime::<Utc>::MIN_UTC, |d| d.created);
            stores.push((created, name));
        }

        stores.sort_by(|a, b| b.cmp(a));
        Ok(stores.into_iter().map(|(_, name)| name).collect())
    }

    async fn open(&self, name: &str) -> Result<()> {
        let dir = self.store_dir(name)?;
        tokio::fs::create_dir_all(dir.join(ENTRIES)).await?;
        if Self::read_descriptor(&dir).await.is_none() {
            let descriptor = StoreDescriptor {
                name: name.to_string(),
                created: Utc::now(),
            };
            write_atomic(&dir.join(DESCRIPTOR), &serde_json::to_vec(&descriptor)?).await?;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, key: &str, response: &StoredResponse) -> Result<()> {
        self.open(name).await?;
        let (meta_path, body_path) = Self::entry_paths(&self.store_dir(name)?, key);
        let meta = EntryMeta {
            key: key.to_string(),
            status: response.status,
            headers: response.headers.clone(),
        };
        write_atomic(&body_path, &response.body).await?;
        write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await?;
        Ok(())
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<StoredResponse>> {
        let (meta_path, body_path) = Self::entry_paths(&self.store_dir(name)?, key);
        let raw = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMeta = serde_json::from_slice(&raw)?;
        let body = tokio::fs::read(&body_path).await?;
        Ok(Some(StoredResponse {
            status: meta.status,
            headers: meta.headers,
            body: body.into(),
        }))
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>> {
        let dir = self.store_dir(name)?.join(ENTRIES);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<EntryMeta>(&raw) {
                    Ok(meta) => keys.push(meta.key),
                    Err(e) => log::warn!("Skipping corrupt entry {}: {e}", path.display()),
                },
                // Deleted concurrently.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
