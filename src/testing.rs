//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::config::CacheConfig;
use crate::controller::VersionController;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::notify::{Broadcast, Notifier};
use crate::origin::{Origin, OriginRequest};
use crate::store::{CacheStorage, StoredResponse};

pub const BASE: &str = "http://origin.test/";
pub const MANIFEST: &str = "/cache-manifest.json";

/// Scriptable origin keyed by request path (query ignored).
pub struct MockOrigin {
    base: Url,
    routes: Mutex<HashMap<String, StoredResponse>>,
    hits: Mutex<HashMap<String, usize>>,
    last: Mutex<Option<OriginRequest>>,
    offline: AtomicBool,
    manifest_failures: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl MockOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Url::parse(BASE).unwrap(),
            routes: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
            last: Mutex::new(None),
            offline: AtomicBool::new(false),
            manifest_failures: AtomicUsize::new(0),
            latency: Mutex::new(None),
        })
    }

    pub fn serve(&self, path: &str, body: &str) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            StoredResponse::new(200, body.to_string()).with_header("content-type", "text/plain"),
        );
    }

    pub fn serve_status(&self, path: &str, status: u16) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), StoredResponse::new(status, "nope"));
    }

    /// Serves the manifest plus every file it lists, with body `"<version>:<path>"`.
    pub fn publish(&self, manifest: &Manifest) {
        self.serve(MANIFEST, &serde_json::to_string(manifest).unwrap());
        for file in &manifest.files {
            self.serve(file, &body_for(&manifest.version, file));
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `n` manifest requests fail as unreachable.
    pub fn fail_manifest(&self, n: usize) {
        self.manifest_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn last_request(&self) -> Option<OriginRequest> {
        self.last.lock().unwrap().clone()
    }
}

pub fn body_for(version: &str, path: &str) -> String {
    format!("{version}:{path}")
}

#[async_trait]
impl Origin for MockOrigin {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn fetch(&self, request: OriginRequest) -> Result<StoredResponse> {
        let path = request.url.path().to_string();
        *self.hits.lock().unwrap().entry(path.clone()).or_default() += 1;
        *self.last.lock().unwrap() = Some(request);

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Unreachable(path));
        }
        if path == MANIFEST
            && self
                .manifest_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Unreachable(path));
        }
        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| StoredResponse::new(404, "not found")))
    }
}

pub fn controller(
    origin: &Arc<MockOrigin>,
    storage: &Arc<dyn CacheStorage>,
    config: CacheConfig,
) -> Arc<VersionController> {
    Arc::new(
        VersionController::new(config, origin.clone(), Arc::clone(storage), Notifier::default())
            .unwrap(),
    )
}

/// Drains every broadcast currently buffered in a receiver.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<Broadcast>) -> Vec<Broadcast> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}
