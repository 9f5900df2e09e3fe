//! Observer feed for intercepted traffic
//!
//! The engine publishes [`ProxyEvent`]s into an [`EventHub`]; any number of
//! consumers subscribe. The bundled [`RequestLog`] keeps a bounded history
//! for the admin endpoints.

pub mod handlers;
pub mod log;

pub use log::RequestLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::proxy::capture::{InterceptedRequest, StreamDelta};
use crate::proxy::error::FailureKind;
use crate::proxy::rotation::RotationState;

/// Events emitted by the engine for observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// A request was accepted; full record
    RequestCaptured { record: InterceptedRequest },
    /// A request changed state; full record
    RequestUpdated { record: InterceptedRequest },
    /// New content arrived on a streamed response
    StreamDelta(StreamDelta),
    /// An attempt failed and another one is scheduled
    RetryScheduled(RetryAttempt),
    /// A request reached a terminal state; full record
    RequestFinished { record: InterceptedRequest },
}

impl ProxyEvent {
    pub fn request_id(&self) -> Uuid {
        match self {
            ProxyEvent::RequestCaptured { record }
            | ProxyEvent::RequestUpdated { record }
            | ProxyEvent::RequestFinished { record } => record.id,
            ProxyEvent::StreamDelta(delta) => delta.request_id,
            ProxyEvent::RetryScheduled(attempt) => attempt.request_id,
        }
    }
}

/// Outcome of a single engine attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Retryable,
    Fatal,
}

/// One attempt of the engine's retry loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub request_id: Uuid,
    pub attempt: u32,
    pub key_index: usize,
    pub model: String,
    pub outcome: AttemptOutcome,
    pub kind: Option<FailureKind>,
    /// Delay before the next attempt
    pub wait_ms: u64,
}

/// Aggregate counters served by `/admin/stats`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyStats {
    pub total_requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub retained: usize,
    pub key_count: usize,
    pub model_count: usize,
    pub key_index: usize,
    pub model_index: usize,
    /// Per-model attempt counters, in pool order
    #[serde(default)]
    pub models: Vec<ModelStats>,
}

/// Attempt counters for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelStats {
    pub model: String,
    /// Upstream attempts made with this model
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: Option<f64>,
    pub last_used: Option<DateTime<Utc>>,
    /// Taken out of rotation after too many failures
    pub dropped: bool,
}

impl ModelStats {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    /// Count one finished attempt
    pub fn record(&mut self, success: bool, latency: Duration) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_latency_ms = self
            .total_latency_ms
            .saturating_add(latency.as_millis() as u64);
        self.avg_latency_ms = Some(self.total_latency_ms as f64 / self.requests as f64);
        self.last_used = Some(Utc::now());
    }
}

impl ProxyStats {
    pub fn with_rotation(mut self, rotation: RotationState) -> Self {
        self.key_index = rotation.key_index;
        self.model_index = rotation.model_index;
        self
    }
}

/// Multi-consumer notification channel.
///
/// Publishing never waits: subscribers that fall behind lose the oldest
/// events and see a `Lagged` error on their next receive.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ProxyEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
