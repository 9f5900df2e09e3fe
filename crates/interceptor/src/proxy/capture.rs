//! Intercepted request/response records
//!
//! One [`InterceptedRequest`] exists per inbound call. The engine owns it and
//! mutates it as attempts are made and chunks arrive; observers receive
//! clones through the notification channel. Once the record reaches a
//! terminal state every mutator is a no-op.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::error::{FailureKind, UpstreamFailure};
use super::streaming::{FinalRecord, IncrementalUpdate, Termination, decode_utf8_prefix};

/// Headers whose values never leave the proxy unredacted
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
];

const REDACTED: &str = "****";

/// Lifecycle of an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Attempting,
    Streaming,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// Token accounting reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Read the top-level `usage` object of a completion payload
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let usage = payload.get("usage")?;
        if !usage.is_object() {
            return None;
        }
        let field = |name: &str| usage.get(name).and_then(Value::as_u64);
        Some(Self {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        })
    }
}

/// What the caller sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    /// Inbound path and query
    pub path: String,
    /// Upstream URL the request is forwarded to
    pub target_url: String,
    /// Inbound headers with credentials redacted
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// What the upstream returned so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Raw body (SSE text for streams)
    pub body: String,
    /// Human-readable content extracted from the body
    pub content: String,
    pub is_streaming: bool,
    pub complete: bool,
    pub usage: Option<TokenUsage>,
    pub chunk_count: usize,
    pub parse_skips: usize,
    pub termination: Option<Termination>,
    /// Trailing bytes of an incomplete UTF-8 sequence not yet in `body`
    #[serde(skip)]
    raw_carry: Vec<u8>,
}

impl ResponseSnapshot {
    /// Append raw streamed bytes to `body`, holding back a split character
    fn push_raw(&mut self, chunk: &[u8]) {
        self.raw_carry.extend_from_slice(chunk);
        let text = decode_utf8_prefix(&mut self.raw_carry, false);
        self.body.push_str(&text);
    }

    fn flush_raw(&mut self) {
        if !self.raw_carry.is_empty() {
            let text = decode_utf8_prefix(&mut self.raw_carry, true);
            self.body.push_str(&text);
        }
    }
}

/// Terminal failure details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub status: Option<u16>,
}

/// Incremental update published while a response streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub request_id: Uuid,
    /// Text extracted from this chunk
    pub delta: String,
    /// Length of the reassembled content after this chunk
    pub content_len: usize,
    pub chunk_count: usize,
    pub usage: Option<TokenUsage>,
    pub parse_skips: usize,
    /// The `[DONE]` sentinel has been seen
    pub done: bool,
}

/// A complete request/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptedRequest {
    pub id: Uuid,
    pub state: RequestState,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub received_at: DateTime<Utc>,
    pub first_byte_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Number of engine attempts made so far
    pub attempts: u32,
    /// Key pool index used by the latest attempt
    pub key_index: Option<usize>,
    /// Model used by the latest attempt
    pub model: Option<String>,
    pub error: Option<FailureRecord>,
}

impl InterceptedRequest {
    pub fn new(request: RequestSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RequestState::Received,
            request,
            response: None,
            received_at: Utc::now(),
            first_byte_at: None,
            completed_at: None,
            duration_ms: None,
            attempts: 0,
            key_index: None,
            model: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record the start of an engine attempt
    pub fn begin_attempt(&mut self, attempt: u32, key_index: usize, model: &str) {
        if self.is_terminal() {
            return;
        }
        self.state = RequestState::Attempting;
        self.attempts = attempt;
        self.key_index = Some(key_index);
        self.model = Some(model.to_string());
    }

    /// Response headers arrived for a streamed body
    pub fn begin_streaming(&mut self, status: u16, headers: &HeaderMap) {
        if self.is_terminal() {
            return;
        }
        self.state = RequestState::Streaming;
        self.response = Some(ResponseSnapshot {
            status,
            headers: header_snapshot(headers),
            is_streaming: true,
            ..ResponseSnapshot::default()
        });
    }

    pub fn mark_first_byte(&mut self) {
        if self.first_byte_at.is_none() && !self.is_terminal() {
            self.first_byte_at = Some(Utc::now());
        }
    }

    /// Fold one chunk into the streaming snapshot
    pub fn apply_update(&mut self, raw_chunk: &[u8], update: &IncrementalUpdate) {
        if self.is_terminal() {
            return;
        }
        if let Some(response) = self.response.as_mut() {
            response.push_raw(raw_chunk);
            response.content.push_str(&update.delta);
            response.chunk_count = update.chunk_count;
            response.parse_skips = update.parse_skips;
            if update.usage.is_some() {
                response.usage = update.usage;
            }
        }
    }

    /// Fold a published delta into a retained copy of the record
    pub fn apply_delta(&mut self, delta: &StreamDelta) {
        if self.is_terminal() || delta.request_id != self.id {
            return;
        }
        self.state = RequestState::Streaming;
        let response = self.response.get_or_insert_with(|| ResponseSnapshot {
            is_streaming: true,
            ..ResponseSnapshot::default()
        });
        response.content.push_str(&delta.delta);
        response.chunk_count = delta.chunk_count;
        response.parse_skips = delta.parse_skips;
        if delta.usage.is_some() {
            response.usage = delta.usage;
        }
    }

    /// Buffered response delivered in full
    pub fn complete_buffered(&mut self, status: u16, headers: &HeaderMap, body: &[u8]) {
        if self.is_terminal() {
            return;
        }
        let (content, usage) = extract_buffered_content(body);
        self.response = Some(ResponseSnapshot {
            status,
            headers: header_snapshot(headers),
            body: String::from_utf8_lossy(body).into_owned(),
            content,
            is_streaming: false,
            complete: true,
            usage,
            chunk_count: 1,
            parse_skips: 0,
            termination: Some(Termination::Clean),
            raw_carry: Vec::new(),
        });
        self.mark_first_byte();
        self.finish(RequestState::Completed);
    }

    /// Streamed response ended (cleanly or truncated)
    pub fn complete_stream(&mut self, record: FinalRecord) {
        if self.is_terminal() {
            return;
        }
        let response = self.response.get_or_insert_with(|| ResponseSnapshot {
            is_streaming: true,
            ..ResponseSnapshot::default()
        });
        response.flush_raw();
        if record.content.is_empty() && record.event_count == 0 {
            // Nothing readable was extracted; show the raw body instead.
            response.content = response.body.clone();
        } else {
            response.content = record.content;
        }
        response.chunk_count = record.chunk_count;
        response.parse_skips = record.parse_skips;
        response.usage = record.usage.or(response.usage);
        response.termination = Some(record.termination);
        response.complete = true;
        self.finish(RequestState::Completed);
    }

    /// Terminal failure
    pub fn fail(&mut self, failure: &UpstreamFailure) {
        if self.is_terminal() {
            return;
        }
        if let Some(response) = self.response.as_mut() {
            response.flush_raw();
            response.termination = Some(Termination::Truncated);
        }
        self.error = Some(FailureRecord {
            kind: failure.kind,
            message: failure.message.clone(),
            status: failure.status,
        });
        self.finish(RequestState::Failed);
    }

    fn finish(&mut self, state: RequestState) {
        let now = Utc::now();
        self.state = state;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.received_at).num_milliseconds().max(0) as u64);
    }
}

/// Copy headers into a sorted map, redacting credentials
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut snapshot = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_lowercase();
        let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
            redact_credential(value.to_str().unwrap_or_default())
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        snapshot.insert(name, value);
    }
    snapshot
}

fn header_snapshot(headers: &HeaderMap) -> BTreeMap<String, String> {
    redact_headers(headers)
}

/// Keep the auth scheme, hide the credential
fn redact_credential(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("bearer") => format!("{scheme} {REDACTED}"),
        _ => REDACTED.to_string(),
    }
}

/// Mask a secret for logs: first few characters, then stars
pub fn mask_secret(secret: &str) -> String {
    const VISIBLE: usize = 8;
    if secret.len() <= VISIBLE {
        return REDACTED.to_string();
    }
    let visible: String = secret.chars().take(VISIBLE).collect();
    format!("{visible}{REDACTED}")
}

/// Readable content and usage from a buffered completion body.
///
/// Prefers `choices[0].message.content`, falls back to pretty-printed JSON,
/// then to the raw text.
pub fn extract_buffered_content(body: &[u8]) -> (String, Option<TokenUsage>) {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return (String::from_utf8_lossy(body).into_owned(), None);
    };

    let usage = TokenUsage::from_payload(&json);
    let content = json
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            serde_json::to_string_pretty(&json)
                .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
        });

    (content, usage)
}
