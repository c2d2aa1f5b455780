//! Local HTTP front end: control endpoints plus the caching reverse proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::controller::VersionController;
use crate::error::{Error, Result};
use crate::intercept::{InterceptRequest, Interceptor};
use crate::notify::{Broadcast, ClientCommand};
use crate::store::{StoredResponse, is_hop_by_hop};

#[derive(Clone)]
struct AppState {
    controller: Arc<VersionController>,
    interceptor: Arc<Interceptor>,
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(Broadcast::CacheStatus(state.controller.cache_status().await))
}

async fn command(
    State(state): State<AppState>,
    axum::Json(command): axum::Json<ClientCommand>,
) -> Response {
    match state.controller.handle_command(command).await {
        Some(reply) => axum::Json(reply).into_response(),
        None => (StatusCode::ACCEPTED, axum::Json(json!({ "status": "accepted" }))).into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, message: &Broadcast) -> std::result::Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|e| log::error!("Encode failed: {e}"))?;
    socket.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client = Uuid::new_v4();
    let notifier = state.controller.notifier();
    let mut rx = notifier.subscribe();
    log::info!("Client {client} connected ({} listening)", notifier.client_count());

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Ok(message) => {
                    if send(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Client {client} missed {missed} broadcast(s)");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientCommand>(text.as_str()) {
                        Ok(command) => {
                            if let Some(reply) = state.controller.handle_command(command).await
                                && send(&mut socket, &reply).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Client {client} sent an invalid command: {e}"),
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    log::info!("Client {client} disconnected");
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The origin is always a bare root; `ServerConfig::origin_url` rejects paths.
    let mut url = state.controller.base_url().clone();
    url.set_path(uri.path());
    url.set_query(uri.query());

    let navigation = is_navigation(&method, &headers);
    let request = InterceptRequest {
        method,
        url,
        headers: headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body,
        navigation,
    };
    into_response(state.interceptor.handle(request).await)
}

/// True for top-level page loads.
#[must_use]
pub fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if header("sec-fetch-mode").is_some_and(|m| m.eq_ignore_ascii_case("navigate")) {
        return true;
    }
    *method == Method::GET
        && header("accept").is_some_and(|accept| {
            accept
                .split(',')
                .next()
                .is_some_and(|first| first.trim().starts_with("text/html"))
        })
}

fn into_response(stored: StoredResponse) -> Response {
    let mut response = Response::new(Body::from(stored.body));
    *response.status_mut() =
        StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = response.headers_mut();
    for (name, value) in stored.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.append(name, value);
        }
    }
    response
}

fn router(controller: Arc<VersionController>, interceptor: Arc<Interceptor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__cache/health", get(health))
        .route("/__cache/status", get(status))
        .route("/__cache/command", post(command))
        .route("/__cache/ws", get(ws_handler))
        .fallback(proxy)
        .layer(cors)
        .with_state(AppState {
            controller,
            interceptor,
        })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                _ = sigterm.recv() => log::info!("Received SIGTERM"),
            },
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received SIGINT");
    }
}

/// Serves the proxy until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn run_server(
    config: &ServerConfig,
    controller: Arc<VersionController>,
    interceptor: Arc<Interceptor>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on http://{addr}, proxying {}", config.origin);

    axum::serve(listener, router(controller, interceptor))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::manifest::Manifest;
    use crate::store::{CacheStorage, MemoryStorage};
    use crate::testing::{MockOrigin, body_for, controller};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn navigation_detection() {
        assert!(is_navigation(&Method::GET, &headers(&[("sec-fetch-mode", "navigate")])));
        assert!(is_navigation(
            &Method::GET,
            &headers(&[("accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")])
        ));
        assert!(!is_navigation(&Method::GET, &headers(&[("accept", "*/*")])));
        assert!(!is_navigation(&Method::GET, &headers(&[("sec-fetch-mode", "cors")])));
        assert!(!is_navigation(&Method::POST, &headers(&[("accept", "text/html")])));
    }

    #[test]
    fn stored_headers_are_copied() {
        let response = into_response(
            StoredResponse::new(201, "x")
                .with_header("content-type", "text/css")
                .with_header("transfer-encoding", "chunked"),
        );
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/css");
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    async fn spawn_server() -> (SocketAddr, Arc<MockOrigin>) {
        let origin = MockOrigin::new();
        origin.publish(&Manifest::new("1", ["/index.html", "/app.js"]));
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let ctl = controller(&origin, &storage, CacheConfig::default());
        ctl.install().await;
        let interceptor = Arc::new(Interceptor::new(Arc::clone(&ctl), origin.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(ctl, interceptor)).await.unwrap();
        });
        (addr, origin)
    }

    #[tokio::test]
    async fn control_endpoints() {
        let (addr, _) = spawn_server().await;
        let client = reqwest::Client::new();

        let get_json = |path: &str| {
            let request = client.get(format!("http://{addr}{path}"));
            async move {
                let text = request.send().await.unwrap().text().await.unwrap();
                serde_json::from_str::<serde_json::Value>(&text).unwrap()
            }
        };

        let health = get_json("/__cache/health").await;
        assert_eq!(health, json!({"status": "ok"}));

        let status = get_json("/__cache/status").await;
        assert_eq!(status["type"], "cache-status");
        assert_eq!(status["status"], "incomplete");
        assert_eq!(status["fileCount"], 3);

        let accepted = client
            .post(format!("http://{addr}/__cache/command"))
            .header("content-type", "application/json")
            .body(r#"{"type":"update-cache"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn fallback_serves_from_cache() {
        let (addr, origin) = spawn_server().await;

        let body = reqwest::get(format!("http://{addr}/app.js"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert_eq!(body, body_for("1", "/app.js"));
        assert_eq!(origin.hits("/app.js"), 1);
    }
}
