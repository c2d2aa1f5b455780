//! Version reconciliation, lifecycle, and offline handling.
//!
//! Every lifecycle event runs the same reconciliation pass: fetch the
//! manifest, compare it to the newest usable store, then verify, populate,
//! or fall back to offline serving. In-memory state is only a cache of what
//! the stores on disk say, so a pass may start from [`Phase::Uninitialized`]
//! at any time.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use reqwest::Url;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestFetcher};
use crate::notify::{Broadcast, CacheStatus, ClientCommand, Notifier, Status, StoreDebug};
use crate::origin::Origin;
use crate::populate::Populator;
use crate::store::{CacheStorage, CurrentStore, StoreIndex};
use crate::verify::IntegrityVerifier;

/// Where the reconciliation state machine currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Uninitialized,
    Reconciling,
    OnlineCurrent,
    Populating,
    OfflineServing,
    Error,
}

/// Install/activate lifecycle of this process instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    #[default]
    Installing,
    /// Installed, not yet serving from the cache.
    Waiting,
    Active,
}

/// What started a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Install,
    Activate,
    /// A client sent `update-cache`.
    Explicit,
    /// Offline reconnection probe.
    Retry,
}

/// Process-wide state. Lost on restart and re-derived from the stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub phase: Phase,
    pub lifecycle: Lifecycle,
    pub current_store: Option<String>,
    pub current_version: Option<String>,
    pub offline: bool,
    /// Store being written by an in-flight population.
    pub populating: Option<String>,
}

pub struct VersionController {
    config: CacheConfig,
    base: Url,
    fetcher: Arc<ManifestFetcher>,
    index: Arc<StoreIndex>,
    populator: Populator,
    verifier: IntegrityVerifier,
    notifier: Notifier,
    state: RwLock<ProcessState>,
    retry: Mutex<Option<CancellationToken>>,
    // One reconciliation at a time; see DESIGN.md.
    gate: tokio::sync::Mutex<()>,
}

impl VersionController {
    /// Wires the fetcher, index, populator, and verifier together.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest path cannot be resolved on the origin.
    pub fn new(
        config: CacheConfig,
        origin: Arc<dyn Origin>,
        storage: Arc<dyn CacheStorage>,
        notifier: Notifier,
    ) -> Result<Self> {
        let base = origin.base_url().clone();
        let fetcher = Arc::new(ManifestFetcher::new(
            Arc::clone(&origin),
            &config.manifest_path,
        )?);
        let index = Arc::new(StoreIndex::new(storage, &config));
        let populator = Populator::new(
            origin,
            Arc::clone(&index),
            Arc::clone(&fetcher),
            config.batch_size,
        );
        let verifier = IntegrityVerifier::new(Arc::clone(&index), base.clone());

        Ok(Self {
            config,
            base,
            fetcher,
            index,
            populator,
            verifier,
            notifier,
            state: RwLock::new(ProcessState::default()),
            retry: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    #[must_use]
    pub const fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    #[must_use]
    pub fn index(&self) -> &StoreIndex {
        &self.index
    }

    /// A copy of the current process state.
    #[must_use]
    pub fn snapshot(&self) -> ProcessState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut ProcessState) -> T) -> T {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn current_store(&self) -> Option<String> {
        self.snapshot().current_store
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.snapshot().lifecycle == Lifecycle::Active
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.snapshot().offline
    }

    /// True while the offline reconnection task is scheduled.
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        self.retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Points this instance at `store`. Only navigations call this; a
    /// reconciliation never repoints an instance that already has a store.
    pub fn promote(&self, store: &CurrentStore) {
        let previous = self.update(|s| {
            s.current_version = Some(store.version.clone());
            s.current_store.replace(store.name.clone())
        });
        if previous.as_deref() != Some(store.name.as_str()) {
            log::info!(
                "Navigation promoted {} (was {})",
                store.name,
                previous.as_deref().unwrap_or("none")
            );
        }
    }

    /// Runs the install pass, then activates if configured to skip waiting.
    pub async fn install(self: &Arc<Self>) {
        log::info!("Installing");
        self.reconcile(Trigger::Install).await;
        self.update(|s| s.lifecycle = Lifecycle::Waiting);
        if self.config.skip_waiting {
            self.activate().await;
        } else {
            log::info!("Installed; waiting for skip-waiting");
        }
    }

    /// Starts serving from the cache and reconciles again.
    pub async fn activate(self: &Arc<Self>) {
        self.update(|s| s.lifecycle = Lifecycle::Active);
        log::info!("Activated");
        self.reconcile(Trigger::Activate).await;
    }

    /// Runs one reconciliation pass. Never fails: every outcome is broadcast.
    pub async fn reconcile(self: &Arc<Self>, trigger: Trigger) {
        let _guard = self.gate.lock().await;
        let timeout = if trigger == Trigger::Retry {
            self.config.retry_timeout()
        } else {
            self.config.manifest_timeout()
        };
        log::info!("Reconciling ({trigger:?})");
        self.update(|s| s.phase = Phase::Reconciling);

        let (manifest, existing) =
            tokio::join!(self.fetcher.fetch(timeout), self.index.find_current());
        let existing = existing.unwrap_or_else(|e| {
            log::warn!("Cannot enumerate stores: {e}");
            None
        });

        let Some(manifest) = manifest else {
            self.enter_offline(existing);
            return;
        };

        if self.update(|s| std::mem::take(&mut s.offline)) {
            log::info!("Origin reachable again; leaving offline mode");
            self.stop_retry();
        }

        let state = self.snapshot();
        let target = self.index.store_name(&manifest.version);
        if state.current_store.as_deref() == Some(target.as_str())
            && self.keep_current(&target, &manifest).await
        {
            return;
        }

        let mut previous_version = state.current_version;
        if let Some(found) = existing {
            if found.version == manifest.version {
                if self.reuse_if_complete(&found, &manifest).await {
                    return;
                }
            } else {
                previous_version = Some(found.version);
            }
        }

        self.install_version(&manifest, previous_version).await;
    }

    /// Handles a manifest naming the version this instance already serves,
    /// including a rollback to it after a newer store was built. The store
    /// is never deleted: a complete one is kept and every other store goes,
    /// an incomplete one keeps serving and is reported as such. Returns
    /// false only if the store no longer exists.
    async fn keep_current(&self, store: &str, manifest: &Manifest) -> bool {
        let complete = self.verifier.verify(store, manifest).await.unwrap_or_else(|e| {
            log::warn!("Cannot verify {store}: {e}");
            false
        });
        if !complete {
            let exists = self
                .index
                .storage()
                .list()
                .await
                .map_or(true, |names| names.iter().any(|n| n == store));
            if !exists {
                log::warn!("Current store {store} is gone; rebuilding");
                return false;
            }
        }

        self.update(|s| s.phase = Phase::OnlineCurrent);
        let status = if complete {
            match self.index.cleanup_others(&[store]).await {
                Ok(removed) if !removed.is_empty() => {
                    log::info!("Version {} is current again; removed {removed:?}", manifest.version);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Store cleanup failed: {e}"),
            }
            log::info!("Store {store} is complete for version {}", manifest.version);
            Status::Ready
        } else {
            log::warn!("Store {store} is in use and incomplete; serving it as is");
            Status::Incomplete
        };
        self.notifier.status(
            CacheStatus::new(status)
                .with_version(Some(&manifest.version))
                .with_file_count(manifest.files.len()),
        );
        true
    }

    /// Adopts a store whose version matches the manifest if it is complete;
    /// otherwise deletes it so it gets rebuilt. Returns true if adopted.
    /// `found` is never this instance's current store.
    async fn reuse_if_complete(&self, found: &CurrentStore, manifest: &Manifest) -> bool {
        match self.verifier.verify(&found.name, manifest).await {
            Ok(true) => {
                self.adopt_if_unset(found);
                let current = self.update(|s| {
                    s.phase = Phase::OnlineCurrent;
                    s.current_version.clone()
                });
                log::info!("Store {} is complete for version {}", found.name, manifest.version);
                self.notifier.status(
                    CacheStatus::new(Status::Ready)
                        .with_version(current)
                        .with_file_count(manifest.files.len()),
                );
                return true;
            }
            Ok(false) => log::warn!("Store {} is incomplete; rebuilding", found.name),
            Err(e) => log::warn!("Cannot verify {}: {e}; rebuilding", found.name),
        }

        if let Err(e) = self.index.storage().delete(&found.name).await {
            log::error!("Failed to delete stale store {}: {e}", found.name);
        }
        false
    }

    async fn install_version(&self, manifest: &Manifest, previous_version: Option<String>) {
        let target = self.index.store_name(&manifest.version);
        self.update(|s| {
            s.phase = Phase::Populating;
            s.populating = Some(target);
        });
        self.notifier.status(
            CacheStatus::new(Status::Caching)
                .with_progress(0, manifest.files.len())
                .with_version(Some(&manifest.version)),
        );

        match self.populator.populate(manifest, &self.notifier).await {
            Ok(name) => {
                let first_install = self.update(|s| {
                    s.populating = None;
                    s.phase = Phase::OnlineCurrent;
                    // A vanished current store rebuilt under its own name stays current.
                    let first = s.current_store.as_deref().is_none_or(|c| c == name);
                    if first {
                        s.current_store = Some(name.clone());
                        s.current_version = Some(manifest.version.clone());
                    }
                    first
                });

                if first_install {
                    log::info!("Promoted {name}");
                    if let Err(e) = self.index.cleanup_others(&[&name]).await {
                        log::warn!("Store cleanup failed: {e}");
                    }
                } else {
                    log::info!("Version {} is cached in {name}; it takes over on the next navigation", manifest.version);
                }

                let upgraded_from = previous_version.filter(|p| *p != manifest.version);
                let mut ready = CacheStatus::new(Status::Ready)
                    .with_version(Some(&manifest.version))
                    .with_file_count(manifest.files.len());
                if let Some(previous) = &upgraded_from {
                    ready = ready.with_update_from(previous);
                }
                self.notifier.status(ready);
                if let Some(previous) = upgraded_from {
                    self.notifier.broadcast(Broadcast::UpdateAvailable {
                        version: manifest.version.clone(),
                        previous_version: Some(previous),
                    });
                }
            }
            Err(e) => {
                log::error!("Caching version {} failed: {e}", manifest.version);
                self.update(|s| {
                    s.populating = None;
                    s.phase = if s.current_store.is_some() {
                        Phase::OnlineCurrent
                    } else {
                        Phase::Error
                    };
                });
                let mut status = CacheStatus::new(Status::Error).with_message(e.to_string());
                if let Error::Population { errors, .. } = e {
                    status = status.with_errors(errors);
                }
                self.notifier.status(status);
            }
        }
    }

    fn adopt_if_unset(&self, found: &CurrentStore) {
        self.update(|s| {
            if s.current_store.is_none() {
                s.current_store = Some(found.name.clone());
                s.current_version = Some(found.version.clone());
            }
        });
    }

    fn enter_offline(self: &Arc<Self>, existing: Option<CurrentStore>) {
        let Some(found) = existing else {
            log::error!("Origin unreachable and nothing is cached");
            self.update(|s| {
                s.phase = Phase::Error;
                s.offline = false;
            });
            self.stop_retry();
            self.notifier.status(
                CacheStatus::new(Status::Error)
                    .with_message("No cached content and no network connection"),
            );
            return;
        };

        self.adopt_if_unset(&found);
        let version = self.update(|s| {
            s.phase = Phase::OfflineServing;
            s.offline = true;
            s.current_version.clone()
        });
        log::warn!("Origin unreachable; serving {} offline", found.name);
        self.start_retry();
        self.notifier
            .status(CacheStatus::new(Status::Offline).with_version(version));
    }

    /// Schedules reconnection probes. A no-op if already scheduled.
    fn start_retry(self: &Arc<Self>) {
        let mut slot = self.retry.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let period = self.config.retry_interval();
        let controller: Weak<Self> = Arc::downgrade(self);
        log::info!("Probing origin every {period:?}");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if !controller.is_offline() {
                    controller.stop_retry();
                    break;
                }
                log::info!("Probing origin");
                controller.reconcile(Trigger::Retry).await;
            }
            log::debug!("Reconnection probing stopped");
        });
    }

    fn stop_retry(&self) {
        if let Some(token) = self
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    /// Answers a client command. Commands without a direct reply return `None`.
    pub async fn handle_command(self: &Arc<Self>, command: ClientCommand) -> Option<Broadcast> {
        log::debug!("Client command: {command:?}");
        match command {
            ClientCommand::CheckCache => Some(Broadcast::CacheStatus(self.cache_status().await)),
            ClientCommand::UpdateCache => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.reconcile(Trigger::Explicit).await });
                None
            }
            ClientCommand::ClearCache => {
                let status = match self.clear().await {
                    Ok(n) => CacheStatus::new(Status::Checking)
                        .with_file_count(0)
                        .with_message(format!("Cleared {n} store(s)")),
                    Err(e) => CacheStatus::new(Status::Error).with_message(e.to_string()),
                };
                Some(Broadcast::CacheStatus(status))
            }
            ClientCommand::DebugCache => match self.debug_info().await {
                Ok(stores) => Some(Broadcast::CacheDebug { stores }),
                Err(e) => Some(Broadcast::CacheStatus(
                    CacheStatus::new(Status::Error).with_message(e.to_string()),
                )),
            },
            ClientCommand::SkipWaiting => {
                if self.snapshot().lifecycle == Lifecycle::Waiting {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.activate().await });
                }
                None
            }
        }
    }

    /// Status of the current store, judged by entry count alone.
    pub async fn cache_status(&self) -> CacheStatus {
        let state = self.snapshot();
        let Some(store) = state.current_store else {
            return CacheStatus::new(Status::Checking).with_file_count(0);
        };
        match self.index.storage().keys(&store).await {
            Ok(keys) => {
                let status = if keys.len() < self.config.low_water_mark {
                    Status::Incomplete
                } else {
                    Status::Ready
                };
                CacheStatus::new(status)
                    .with_version(state.current_version)
                    .with_file_count(keys.len())
            }
            Err(e) => CacheStatus::new(Status::Checking)
                .with_file_count(0)
                .with_message(e.to_string()),
        }
    }

    /// Deletes every versioned store and forgets all in-memory state.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores cannot be enumerated.
    pub async fn clear(&self) -> Result<usize> {
        self.stop_retry();
        // Waits out an in-flight pass so it cannot promote a half-cleared store.
        let _guard = self.gate.lock().await;
        let removed = self.index.clear_all().await?;
        self.update(|s| {
            *s = ProcessState {
                lifecycle: s.lifecycle,
                ..ProcessState::default()
            };
        });
        log::info!("Cleared {removed} store(s)");
        Ok(removed)
    }

    /// Every store with its entries, for `debug-cache`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be read.
    pub async fn debug_info(&self) -> Result<Vec<StoreDebug>> {
        self.index.describe(&self.base).await
    }
}
