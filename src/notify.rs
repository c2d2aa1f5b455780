//! Messages exchanged with foreground clients and the broadcast hub.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::FileError;

/// Cache state reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Checking,
    Caching,
    Ready,
    Offline,
    Error,
    Incomplete,
}

/// Files processed so far during population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

/// Body of a `cache-status` message. Absent fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FileError>>,
}

impl CacheStatus {
    #[must_use]
    pub const fn new(status: Status) -> Self {
        Self {
            status,
            progress: None,
            version: None,
            updated: None,
            previous_version: None,
            file_count: None,
            message: None,
            errors: None,
        }
    }

    #[must_use]
    pub const fn with_progress(mut self, processed: usize, total: usize) -> Self {
        self.progress = Some(Progress { processed, total });
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Option<impl Into<String>>) -> Self {
        self.version = version.map(Into::into);
        self
    }

    /// Marks the status as an upgrade from `previous`.
    #[must_use]
    pub fn with_update_from(mut self, previous: impl Into<String>) -> Self {
        self.updated = Some(true);
        self.previous_version = Some(previous.into());
        self
    }

    #[must_use]
    pub const fn with_file_count(mut self, count: usize) -> Self {
        self.file_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<FileError>) -> Self {
        self.errors = Some(errors);
        self
    }
}

/// One store in a `cache-debug` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDebug {
    pub name: String,
    pub entry_count: usize,
    pub urls: Vec<String>,
}

/// Core → client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Broadcast {
    CacheStatus(CacheStatus),
    #[serde(rename_all = "camelCase")]
    UpdateAvailable {
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_version: Option<String>,
    },
    CacheDebug {
        stores: Vec<StoreDebug>,
    },
}

impl Broadcast {
    /// Returns the status body if this is a `cache-status` message.
    #[must_use]
    pub const fn as_status(&self) -> Option<&CacheStatus> {
        match self {
            Self::CacheStatus(status) => Some(status),
            _ => None,
        }
    }
}

/// Client → core command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    CheckCache,
    UpdateCache,
    ClearCache,
    DebugCache,
    /// Activate an installed-but-waiting instance now.
    SkipWaiting,
}

/// Fan-out of broadcasts to every connected client.
///
/// Clients that are not listening simply miss messages; slow clients see a
/// lag error on their receiver rather than stalling the sender.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Broadcast>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Registers a new listener.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    /// Number of currently connected listeners.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn broadcast(&self, message: Broadcast) {
        log::debug!("Broadcast to {} client(s): {message:?}", self.client_count());
        // No receivers is not an error: nobody is listening yet.
        let _ = self.tx.send(message);
    }

    pub fn status(&self, status: CacheStatus) {
        self.broadcast(Broadcast::CacheStatus(status));
    }
}
