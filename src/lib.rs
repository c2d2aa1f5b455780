//! mrepo-cache - a versioned offline cache for a web application's static assets.
//!
//! The engine keeps a complete offline mirror of the asset set listed in the
//! origin's manifest, upgrades it atomically when the manifest version changes,
//! keeps running clients on the version they loaded until they navigate, and
//! keeps serving from the mirror when the origin is unreachable.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mrepo_cache::{
//!     CacheConfig, CacheStorage, HttpOrigin, Interceptor, MemoryStorage, Notifier, Origin,
//!     ServerConfig, VersionController,
//! };
//!
//! # async fn example() -> mrepo_cache::Result<()> {
//! let base = ServerConfig::default().origin_url()?;
//! let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(base)?);
//! let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
//! let controller = Arc::new(VersionController::new(
//!     CacheConfig::default(),
//!     Arc::clone(&origin),
//!     storage,
//!     Notifier::default(),
//! )?);
//!
//! // Populate (or reuse) the store for the origin's current version.
//! controller.install().await;
//!
//! let interceptor = Interceptor::new(controller, origin);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod controller;
pub mod error;
pub mod intercept;
pub mod manifest;
pub mod notify;
pub mod origin;
pub mod populate;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod verify;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, CacheConfig, PathConfig, ServerConfig};
pub use controller::{Lifecycle, Phase, ProcessState, Trigger, VersionController};
pub use error::{Error, FileError, Result};
pub use intercept::{InterceptRequest, Interceptor, Route};
pub use manifest::{Manifest, ManifestFetcher};
pub use notify::{Broadcast, CacheStatus, ClientCommand, Notifier, Status};
pub use origin::{HttpOrigin, Origin, OriginRequest};
pub use populate::Populator;
pub use store::{CacheStorage, DiskStorage, MemoryStorage, StoreIndex, StoredResponse};
pub use verify::IntegrityVerifier;
