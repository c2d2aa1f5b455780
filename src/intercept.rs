//! Serves application requests from the current store, with network fallback.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Method, Url};

use crate::controller::VersionController;
use crate::origin::{Origin, OriginRequest};
use crate::store::{StoredResponse, key_of, path_only};

/// An incoming application request.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Top-level page load.
    pub navigation: bool,
}

impl InterceptRequest {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            navigation: false,
        }
    }

    #[must_use]
    pub const fn navigating(mut self) -> Self {
        self.navigation = true;
        self
    }

    fn into_origin(self, bypass_cache: bool) -> OriginRequest {
        OriginRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
            bypass_cache,
        }
    }
}

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forwarded untouched.
    Passthrough,
    /// Answered from the store when possible.
    Cached,
}

pub struct Interceptor {
    controller: Arc<VersionController>,
    origin: Arc<dyn Origin>,
}

impl Interceptor {
    #[must_use]
    pub fn new(controller: Arc<VersionController>, origin: Arc<dyn Origin>) -> Self {
        Self { controller, origin }
    }

    /// Decides whether a request is eligible for the cache at all.
    #[must_use]
    pub fn route(&self, request: &InterceptRequest) -> Route {
        let config = self.controller.config();
        let path = request.url.path();
        if !self.controller.is_active()
            || request.method != Method::GET
            || request.url.origin() != self.controller.base_url().origin()
            || path.starts_with(&config.api_prefix)
            || path.starts_with(&config.stream_prefix)
        {
            Route::Passthrough
        } else {
            Route::Cached
        }
    }

    /// Answers a request. Never fails: unreachable origins yield a synthetic 503.
    pub async fn handle(&self, request: InterceptRequest) -> StoredResponse {
        match self.route(&request) {
            Route::Passthrough => self.passthrough(request).await,
            Route::Cached => self.serve(request).await,
        }
    }

    async fn passthrough(&self, request: InterceptRequest) -> StoredResponse {
        let path = request.url.path().to_string();
        match self.origin.fetch(request.into_origin(false)).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Passthrough {path} failed: {e}");
                StoredResponse::service_unavailable(&path)
            }
        }
    }

    async fn serve(&self, request: InterceptRequest) -> StoredResponse {
        let key = key_of(&request.url);
        let navigation = request.navigation;
        let store = self.resolve_store(navigation).await;

        if let Some(store) = &store
            && let Some(hit) = self.lookup(store, &key).await
        {
            log::debug!("Cache hit {key} in {store}");
            return hit;
        }

        log::debug!("Cache miss {key}");
        match self.origin.fetch(request.into_origin(true)).await {
            Ok(response) => {
                if let Some(store) = &store
                    && response.is_success()
                    && self.controller.config().is_static_asset(path_only(&key))
                {
                    self.write_back(store, &key, &response).await;
                }
                response
            }
            Err(e) => {
                log::warn!("Network fetch of {key} failed: {e}");
                if navigation
                    && let Some(store) = &store
                    && let Some(shell) = self.shell(store).await
                {
                    log::info!("Serving offline shell for {key}");
                    return shell;
                }
                StoredResponse::service_unavailable(path_only(&key))
            }
        }
    }

    /// Store to answer from. Navigations re-resolve against the stores
    /// themselves and promote the result.
    async fn resolve_store(&self, navigation: bool) -> Option<String> {
        let index = self.controller.index();
        if navigation {
            match index.find_current().await {
                Ok(Some(found)) => {
                    self.controller.promote(&found);
                    let mut keep = vec![found.name.as_str()];
                    let populating = self.controller.snapshot().populating;
                    if let Some(p) = populating.as_deref() {
                        keep.push(p);
                    }
                    if let Err(e) = index.cleanup_others(&keep).await {
                        log::warn!("Store cleanup failed: {e}");
                    }
                    return Some(found.name);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Store lookup failed: {e}"),
            }
        }

        if let Some(current) = self.controller.current_store() {
            return Some(current);
        }
        match index.find_current().await {
            Ok(found) => found.map(|f| f.name),
            Err(e) => {
                log::warn!("Store lookup failed: {e}");
                None
            }
        }
    }

    /// Exact key first, then the key without its query.
    async fn lookup(&self, store: &str, key: &str) -> Option<StoredResponse> {
        let storage = self.controller.index().storage();
        let bare = path_only(key);
        let candidates = if bare == key { vec![key] } else { vec![key, bare] };
        for candidate in candidates {
            match storage.get(store, candidate).await {
                Ok(Some(hit)) => return Some(hit),
                Ok(None) => {}
                Err(e) => log::warn!("Reading {candidate} from {store} failed: {e}"),
            }
        }
        None
    }

    async fn shell(&self, store: &str) -> Option<StoredResponse> {
        for key in ["/", "/index.html"] {
            if let Some(hit) = self.lookup(store, key).await {
                return Some(hit);
            }
        }
        None
    }

    async fn write_back(&self, store: &str, key: &str, response: &StoredResponse) {
        match self.controller.index().storage().put(store, key, response).await {
            Ok(()) => log::debug!("Stored {key} in {store}"),
            Err(e) => log::warn!("Failed to store {key} in {store}: {e}"),
        }
    }
}
