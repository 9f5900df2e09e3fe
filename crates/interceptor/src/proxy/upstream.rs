//! Upstream client adapter
//!
//! Wraps one pooled `reqwest::Client`. Each call rewrites credentials and
//! the `model` field, enforces the per-attempt time budget and classifies
//! the outcome into success or an [`UpstreamFailure`]. Transient failures
//! are retried here up to `call_attempts` times before the engine sees them.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::config::{ProxyConfig, RetryConfig};
use crate::error::{InterceptorError, Result};

use super::capture::mask_secret;
use super::error::{FailureKind, UpstreamFailure};
use super::retry::{BackoffPolicy, parse_retry_after};

/// Hop-by-hop headers, never forwarded in either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Inbound headers replaced or dropped before forwarding
const REPLACED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "content-length",
    "accept-encoding",
    "http-referer",
    "x-title",
];

/// A request as the adapter forwards it, independent of the chosen key/model
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path and query relative to the target base URL
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    json: Option<Map<String, Value>>,
}

impl UpstreamRequest {
    pub fn new(method: Method, path_and_query: String, headers: HeaderMap, body: Bytes) -> Self {
        let json = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        };
        Self {
            method,
            path_and_query,
            headers,
            body,
            json,
        }
    }

    /// Whether the body asks for a streamed completion
    pub fn wants_stream(&self) -> bool {
        self.json
            .as_ref()
            .and_then(|map| map.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_json(&self) -> bool {
        self.json.is_some()
    }

    /// Body with `model` replaced; non-object bodies pass through untouched
    pub fn body_for_model(&self, model: &str) -> Bytes {
        let Some(map) = &self.json else {
            return self.body.clone();
        };
        let mut map = map.clone();
        map.insert("model".to_string(), Value::String(model.to_string()));
        match serde_json::to_vec(&Value::Object(map)) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => self.body.clone(),
        }
    }
}

/// Response body as handed to the engine
pub enum UpstreamBody {
    /// Read in full inside the attempt
    Buffered(Bytes),
    /// Still on the wire; the engine pulls chunks
    Streaming(reqwest::Response),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            UpstreamBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// A successful (2xx) upstream response
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Response headers with hop-by-hop and length headers removed
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, UpstreamBody::Streaming(_))
    }

    pub fn is_event_stream(&self) -> bool {
        is_event_stream(self.content_type.as_deref())
    }
}

fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// Pooled HTTP client bound to one upstream base URL
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    referer: String,
    app_name: String,
    backoff: BackoffPolicy,
    call_attempts: u32,
}

impl UpstreamClient {
    pub fn new(proxy: &ProxyConfig, retry: &RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(proxy.connect_timeout())
            .build()
            .map_err(|e| InterceptorError::Upstream(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: proxy.target_base_url.trim_end_matches('/').to_string(),
            referer: proxy.referer(),
            app_name: proxy.app_name.clone(),
            backoff: BackoffPolicy::from_config(retry),
            call_attempts: retry.call_attempts.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full upstream URL for a relative path and query
    pub fn target_url(&self, path_and_query: &str) -> String {
        if path_and_query.is_empty() || path_and_query.starts_with('/') || path_and_query.starts_with('?') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    /// Forward `request` with the given credential and model.
    ///
    /// Transient failures are retried up to `call_attempts` times with
    /// backoff; the last failure is returned to the caller for rotation.
    pub async fn send(
        &self,
        request: &UpstreamRequest,
        key: &str,
        model: &str,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, UpstreamFailure> {
        let mut attempt = 1;
        loop {
            match self.send_once(request, key, model, timeout).await {
                Ok(response) => return Ok(response),
                Err(failure) if failure.is_retryable() && attempt < self.call_attempts => {
                    let wait = self.backoff.delay_for(&failure, attempt);
                    warn!(
                        attempt,
                        kind = %failure.kind,
                        wait_ms = wait.as_millis() as u64,
                        "Upstream call failed, retrying with same credential"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn send_once(
        &self,
        request: &UpstreamRequest,
        key: &str,
        model: &str,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, UpstreamFailure> {
        let deadline = Instant::now() + timeout;
        let url = self.target_url(&request.path_and_query);
        let headers = forward_headers(&request.headers, key, &self.referer, &self.app_name, request.is_json());

        debug!(
            url = %url,
            method = %request.method,
            key = %mask_secret(key),
            model,
            "Forwarding request upstream"
        );

        let pending = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body_for_model(model))
            .send();

        let response = match timeout_at(deadline, pending).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify_transport_error(&e)),
            Err(_) => {
                return Err(UpstreamFailure::timeout(format!(
                    "No response headers within {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = match timeout_at(deadline, response.bytes()).await {
                Ok(Ok(body)) => body,
                _ => Bytes::new(),
            };
            return Err(UpstreamFailure::from_response(status, body, content_type, retry_after));
        }

        let headers = response_headers(response.headers());
        let event_stream = is_event_stream(content_type.as_deref());
        let is_json = content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/json"));

        if event_stream || (request.wants_stream() && !is_json) {
            return Ok(UpstreamResponse {
                status,
                headers,
                content_type,
                body: UpstreamBody::Streaming(response),
            });
        }

        let body = match timeout_at(deadline, response.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                return Err(UpstreamFailure::connection(format!(
                    "Failed to read response body: {e}"
                )));
            }
            Err(_) => {
                return Err(UpstreamFailure::timeout(format!(
                    "Response body not complete within {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        if is_json {
            if let Err(e) = serde_json::from_slice::<Value>(&body) {
                return Err(UpstreamFailure::malformed(format!(
                    "Upstream returned invalid JSON: {e}"
                )));
            }
        }

        Ok(UpstreamResponse {
            status,
            headers,
            content_type,
            body: UpstreamBody::Buffered(body),
        })
    }

    /// Reachability check; any HTTP response counts as reachable
    pub async fn probe(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.client.get(&self.base_url).send()).await {
            Ok(Ok(response)) => {
                debug!(status = response.status().as_u16(), "Upstream probe answered");
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Upstream probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

fn classify_transport_error(e: &reqwest::Error) -> UpstreamFailure {
    if e.is_timeout() {
        UpstreamFailure::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        UpstreamFailure::connection(format!("Failed to connect to upstream: {e}"))
    } else {
        UpstreamFailure::connection(format!("Request failed: {e}"))
    }
}

/// Build the outgoing header set from the inbound one
pub fn forward_headers(
    inbound: &HeaderMap,
    key: &str,
    referer: &str,
    app_name: &str,
    json_body: bool,
) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || REPLACED_REQUEST_HEADERS.contains(&name_str) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    match reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        Err(_) => warn!(key = %mask_secret(key), "API key is not a valid header value"),
    }
    if let Ok(value) = reqwest::header::HeaderValue::from_str(referer) {
        headers.insert("http-referer", value);
    }
    if let Ok(value) = reqwest::header::HeaderValue::from_str(app_name) {
        headers.insert("x-title", value);
    }
    if json_body && !headers.contains_key(reqwest::header::CONTENT_TYPE) {
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
    }

    headers
}

/// Upstream response headers safe to hand back to the caller
pub fn response_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || name_str == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name_str.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}
