//! Configuration types for the cache daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for the offline-cache engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Origin path of the asset manifest.
    pub manifest_path: String,
    /// Prefix shared by every versioned store name.
    pub store_prefix: String,
    /// Number of files downloaded concurrently per batch.
    pub batch_size: usize,
    /// Manifest fetch timeout for regular reconciliation passes.
    pub manifest_timeout_secs: u64,
    /// Interval between reconnection probes while offline.
    pub retry_interval_secs: u64,
    /// Manifest fetch timeout used by reconnection probes.
    pub retry_timeout_secs: u64,
    /// Stores with fewer entries than this report `incomplete`.
    pub low_water_mark: usize,
    /// Requests under this prefix are never cached.
    pub api_prefix: String,
    /// Requests under this prefix are never cached.
    pub stream_prefix: String,
    /// Extensions written back into the store on a network hit.
    pub static_extensions: Vec<String>,
    /// Activate immediately after install instead of waiting for `skip-waiting`.
    pub skip_waiting: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            manifest_path: "/cache-manifest.json".to_string(),
            store_prefix: "mrepo".to_string(),
            batch_size: 10,
            manifest_timeout_secs: 10,
            retry_interval_secs: 30,
            retry_timeout_secs: 5,
            low_water_mark: 10,
            api_prefix: "/api/".to_string(),
            stream_prefix: "/stream/".to_string(),
            static_extensions: [
                "js", "mjs", "html", "css", "json", "svg", "png", "jpg", "jpeg", "gif", "webp",
                "ico", "woff", "woff2", "ttf",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            skip_waiting: true,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the manifest path.
    #[must_use]
    pub fn with_manifest_path(mut self, path: impl Into<String>) -> Self {
        self.manifest_path = path.into();
        self
    }

    /// Sets the number of concurrent downloads per batch.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the reconnection probe interval in seconds.
    #[must_use]
    pub const fn with_retry_interval_secs(mut self, secs: u64) -> Self {
        self.retry_interval_secs = secs;
        self
    }

    /// Sets whether install activates immediately.
    #[must_use]
    pub const fn with_skip_waiting(mut self, skip: bool) -> Self {
        self.skip_waiting = skip;
        self
    }

    #[must_use]
    pub const fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    #[must_use]
    pub const fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    /// Returns true if `path` ends in one of the configured static extensions.
    #[must_use]
    pub fn is_static_asset(&self, path: &str) -> bool {
        let file = path.rsplit('/').next().unwrap_or(path);
        file.rsplit_once('.').is_some_and(|(_, ext)| {
            self.static_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext))
        })
    }
}

/// Where versioned stores live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory holding one subdirectory per versioned store.
    pub store_dir: PathBuf,
}

impl Default for PathConfig {
    /// Uses `STATE_DIRECTORY` (set by systemd when `StateDirectory=` is configured),
    /// falling back to `$XDG_DATA_HOME/mrepo-cache` for interactive use.
    fn default() -> Self {
        let base = std::env::var("STATE_DIRECTORY").map_or_else(
            |_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mrepo-cache")
            },
            PathBuf::from,
        );
        Self {
            store_dir: base.join("stores"),
        }
    }
}

/// Listen address and upstream origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Base URL of the origin server.
    pub origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            origin: "http://127.0.0.1:5000".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parses the origin base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is not an absolute URL, or if it has a
    /// path or query. Requests are proxied path for path onto the origin root.
    pub fn origin_url(&self) -> Result<Url> {
        let url =
            Url::parse(&self.origin).map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.origin)))?;
        if url.path() != "/" || url.query().is_some() {
            return Err(Error::Config(format!(
                "origin must be a bare scheme://host[:port], got {}",
                self.origin
            )));
        }
        Ok(url)
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub paths: PathConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from an optional TOML file, then applies
    /// `MREPO_*` environment overrides and validates the result.
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p)?;
                toml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("{}: {e}", p.display())))?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(origin) = var("MREPO_ORIGIN") {
            self.server.origin = origin;
        }
        if let Some(dir) = var("MREPO_CACHE_DIR") {
            self.paths.store_dir = PathBuf::from(dir);
        }
        if let Some(host) = var("MREPO_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("MREPO_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| Error::Config(format!("MREPO_PORT is not a port: {port}")))?;
        }
        Ok(())
    }

    /// Checks invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.cache.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.cache.retry_interval_secs == 0 {
            return Err(Error::Config(
                "retry_interval_secs must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("manifest_path", &self.cache.manifest_path),
            ("api_prefix", &self.cache.api_prefix),
            ("stream_prefix", &self.cache.stream_prefix),
        ] {
            if !value.starts_with('/') {
                return Err(Error::Config(format!("{name} must start with '/'")));
            }
        }
        self.server.origin_url()?;
        Ok(())
    }
}
