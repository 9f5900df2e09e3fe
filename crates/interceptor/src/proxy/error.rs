//! Upstream failure taxonomy and its mapping to HTTP responses
//!
//! Every failed attempt is classified into a [`FailureKind`]:
//! - Retryable: connection errors, timeouts, 429 and 5xx responses
//! - Fatal: other 4xx responses, malformed bodies and caller cancellation
//! - Non-fatal: a single unparseable SSE line (counted, never raised)
//!
//! Retryable failures stay inside the engine's attempt loop; only the final
//! failure is turned into a response for the caller.

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Non-standard "client closed request" status
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Classification of a failed upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network unreachable, refused or reset
    Connection,
    /// Attempt exceeded its time budget
    Timeout,
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    UpstreamServer,
    /// HTTP 4xx other than 429
    UpstreamClient,
    /// Unparseable body on a buffered call
    MalformedResponse,
    /// One bad SSE line; the stream continues
    StreamParseSkip,
    /// The caller went away or the server is shutting down
    Cancelled,
}

impl FailureKind {
    /// Whether rotating to another key/model may help
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Connection
                | FailureKind::Timeout
                | FailureKind::RateLimited
                | FailureKind::UpstreamServer
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connection => "connection_error",
            FailureKind::Timeout => "timeout_error",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::UpstreamServer => "upstream_server_error",
            FailureKind::UpstreamClient => "upstream_client_error",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::StreamParseSkip => "stream_parse_skip",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status; `None` for success
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(FailureKind::RateLimited),
            500..=599 => Some(FailureKind::UpstreamServer),
            _ => Some(FailureKind::UpstreamClient),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed upstream attempt
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Upstream status, when a response was received
    pub status: Option<u16>,
    /// Upstream body, when a response was received
    pub body: Option<Bytes>,
    /// Upstream content type, when a response was received
    pub content_type: Option<String>,
    /// Parsed `Retry-After`, when present
    pub retry_after: Option<Duration>,
}

impl UpstreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            body: None,
            content_type: None,
            retry_after: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedResponse, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    /// Build a failure from a non-2xx upstream response
    pub fn from_response(
        status: u16,
        body: Bytes,
        content_type: Option<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let kind = FailureKind::from_status(status).unwrap_or(FailureKind::UpstreamClient);
        let preview = String::from_utf8_lossy(&body[..body.len().min(512)]).into_owned();
        Self {
            kind,
            message: format!("Upstream returned status {status}: {preview}"),
            status: Some(status),
            body: Some(body),
            content_type,
            retry_after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Convert the terminal failure into the caller-facing response.
    ///
    /// Client errors are forwarded unchanged. Exhausted retries map to 504,
    /// or 429 when the last failure was a rate limit.
    pub fn into_response(self, request_id: Uuid, attempts: u32, exhausted: bool) -> Response<Body> {
        if self.kind == FailureKind::UpstreamClient {
            if let (Some(status), Some(body)) = (self.status, self.body.clone()) {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let content_type = self
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/json".to_string());
                return Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(body))
                    .unwrap_or_else(|_| fallback_response(status));
            }
        }

        let status = self.response_status(exhausted);
        let body = serde_json::json!({
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
                "request_id": request_id.to_string(),
                "attempts": attempts,
            }
        });

        let mut response = create_json_response(status, &body);
        if self.kind == FailureKind::RateLimited {
            if let Some(retry_after) = self.retry_after {
                if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string())
                {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
        }
        response
    }

    fn response_status(&self, exhausted: bool) -> StatusCode {
        match self.kind {
            FailureKind::Cancelled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::BAD_REQUEST),
            FailureKind::RateLimited if exhausted => StatusCode::TOO_MANY_REQUESTS,
            kind if exhausted && kind.is_retryable() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Create a JSON error response
pub fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    create_json_response(status, &body)
}

fn create_json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| fallback_response(status))
}

fn fallback_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
