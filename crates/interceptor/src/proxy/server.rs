//! HTTP front-end
//!
//! A catch-all route under the configured prefix hands every call to the
//! [`Engine`]; health, readiness and admin routes sit beside it.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::admin::{EventHub, ProxyEvent, RequestLog, handlers};
use crate::config::Config;
use crate::error::{InterceptorError, Result};

use super::engine::{Engine, InboundRequest};
use super::error::create_error_response;

/// Shared application state for all handlers
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Retained history; empty when `log_requests` is off
    pub log: Arc<RequestLog>,
    /// Normalized route prefix ("" forwards everything)
    pub route_prefix: String,
    pub shutdown_grace: Duration,
}

impl AppState {
    /// Build the engine and wire the request log to its event feed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let events = EventHub::new(config.capture.event_buffer);
        let retained = if config.capture.log_requests {
            config.capture.max_requests
        } else {
            0
        };
        let log = Arc::new(RequestLog::new(retained));
        if config.capture.log_requests {
            log.attach(&events);
        }
        let engine = Arc::new(Engine::new(config, events)?);

        Ok(Arc::new(Self {
            engine,
            log,
            route_prefix: config.proxy.normalized_prefix(),
            shutdown_grace: config.proxy.shutdown_grace(),
        }))
    }
}

/// The proxy server
pub struct ProxyServer {
    config: Config,
    state: Arc<AppState>,
}

impl ProxyServer {
    /// Validate the configuration and initialize the engine
    pub fn new(config: Config) -> Result<Self> {
        let state = AppState::new(&config)?;
        Ok(Self { config, state })
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Notification channel carrying every intercepted request
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.state.engine.events().subscribe()
    }

    /// Bind the configured address and serve until Ctrl+C / SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .proxy
            .listen_addr()
            .parse()
            .map_err(|e| InterceptorError::Config(format!("Invalid listen address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| InterceptorError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then drain
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!("Starting proxy server on {addr}");
        tracing::info!(
            "Forwarding {}/* to {}",
            self.state.route_prefix,
            self.state.engine.upstream().base_url()
        );

        let engine = Arc::clone(&self.state.engine);
        let grace = self.state.shutdown_grace;
        let app = create_router(self.state());

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!(grace_secs = grace.as_secs(), "Draining in-flight requests");
                tokio::spawn(async move {
                    engine.drain(grace).await;
                });
            })
            .await
            .map_err(|e| InterceptorError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/admin/events", get(handlers::events_handler))
        .route(
            "/admin/requests",
            get(handlers::list_requests_handler).delete(handlers::clear_requests_handler),
        )
        .route("/admin/requests/{id}", get(handlers::get_request_handler))
        .route("/admin/stats", get(handlers::stats_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Readiness: engine initialized, not draining, upstream reachable if probed
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.engine.is_ready().await {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "draining": state.engine.is_draining(),
            })),
        )
    }
}

/// Forward anything under the route prefix
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response<Body> {
    let Some(rest) = strip_route_prefix(uri.path(), &state.route_prefix) else {
        return create_error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("No route for {}", uri.path()),
        );
    };

    let upstream_path = match uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_string(),
    };
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return create_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("Failed to read request body: {e}"),
            );
        }
    };

    state
        .engine
        .handle(InboundRequest {
            method,
            path,
            upstream_path,
            headers,
            body,
        })
        .await
}

/// Path remainder after `prefix`, if the path lies under it
fn strip_route_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state() -> Arc<AppState> {
        let config = test_config("http://127.0.0.1:9", &["k1"], &["m1"]);
        AppState::new(&config).unwrap()
    }

    #[test]
    fn test_strip_route_prefix() {
        assert_eq!(strip_route_prefix("/v1/chat/completions", "/v1"), Some("/chat/completions"));
        assert_eq!(strip_route_prefix("/v1", "/v1"), Some(""));
        assert_eq!(strip_route_prefix("/v10/models", "/v1"), None);
        assert_eq!(strip_route_prefix("/other", "/v1"), None);
        assert_eq!(strip_route_prefix("/anything", ""), Some("/anything"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body_str = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert!(body_str.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_ready_flips_when_draining() {
        let state = create_test_state();
        let app = create_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.engine.drain(Duration::ZERO).await;

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_path_outside_prefix_is_not_found() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/other/thing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(json["error"]["type"], "not_found");
    }
}
