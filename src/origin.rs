//! Network access to the origin server.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};

use crate::error::{Error, Result};
use crate::store::{StoredResponse, is_hop_by_hop};

/// A request forwarded to the network.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Ask every intermediate cache to revalidate.
    pub bypass_cache: bool,
}

impl OriginRequest {
    /// A plain `GET` with no headers.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            bypass_cache: false,
        }
    }

    #[must_use]
    pub const fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Abstraction over the network for testability.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Base URL every asset path is resolved against.
    fn base_url(&self) -> &Url;

    /// Performs a request. Non-success statuses are returned, not raised.
    async fn fetch(&self, request: OriginRequest) -> Result<StoredResponse>;
}

/// [`Origin`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    base: Url,
}

impl HttpOrigin {
    /// Creates an origin with a tuned HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, base))
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn fetch(&self, request: OriginRequest) -> Result<StoredResponse> {
        let mut builder = self.client.request(request.method, request.url.clone());
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) && !(request.bypass_cache && is_cache_header(name)) {
                builder = builder.header(name, value);
            }
        }
        if request.bypass_cache {
            builder = builder
                .header("cache-control", "no-cache")
                .header("pragma", "no-cache");
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::Unreachable(format!("{}: {e}", request.url))
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(StoredResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_cache_header(name: &str) -> bool {
    ["cache-control", "pragma", "if-none-match", "if-modified-since"]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_defaults() {
        let req = OriginRequest::get(Url::parse("http://o.test/a.js").unwrap());
        assert_eq!(req.method, Method::GET);
        assert!(!req.bypass_cache);
        assert!(req.bypassing_cache().bypass_cache);
    }

    #[test]
    fn conditional_headers_are_cache_headers() {
        assert!(is_cache_header("If-None-Match"));
        assert!(is_cache_header("Cache-Control"));
        assert!(!is_cache_header("accept"));
    }

    #[tokio::test]
    async fn unreachable_origin_is_reported() {
        // Port 9 (discard) on localhost is normally closed.
        let origin = HttpOrigin::new(Url::parse("http://127.0.0.1:9/").unwrap()).unwrap();
        let err = origin
            .fetch(OriginRequest::get(origin.base_url().join("/x").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_) | Error::Http(_)));
    }
}
