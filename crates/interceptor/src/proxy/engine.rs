//! Request interception engine
//!
//! Every inbound call runs as its own task through
//! `Received -> Attempting -> (Streaming) -> Completed | Failed`.
//! The task owns its [`InterceptedRequest`] and publishes a clone on every
//! transition; only the rotator's indices and the in-flight registry are
//! shared between requests.
//!
//! The caller's side is represented by a oneshot sender for the response
//! head and, once streaming, an mpsc sender for body chunks. When either
//! channel closes the caller has gone away and the upstream work is dropped.

use axum::{
    body::Body,
    http::{HeaderMap, Method, Response, StatusCode},
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admin::{AttemptOutcome, EventHub, ModelStats, ProxyEvent, ProxyStats, RetryAttempt};
use crate::config::Config;
use crate::error::Result;

use super::capture::{InterceptedRequest, RequestSnapshot, RequestState, StreamDelta, redact_headers};
use super::error::{FailureKind, UpstreamFailure, create_error_response};
use super::retry::BackoffPolicy;
use super::rotation::Rotator;
use super::streaming::{StreamAccumulator, StreamFormat};
use super::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};

/// Chunks buffered between the upstream reader and the caller
const STREAM_BUFFER: usize = 32;

/// Upper bound on the readiness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type HeadSender = oneshot::Sender<Response<Body>>;
type ChunkSender = mpsc::Sender<std::result::Result<Bytes, std::io::Error>>;

/// An inbound call as the front-end hands it over
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Inbound path and query, as the caller sent it
    pub path: String,
    /// Path and query relative to the upstream base URL
    pub upstream_path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Drives intercepted requests from arrival to a terminal state
#[derive(Debug)]
pub struct Engine {
    rotator: Rotator,
    upstream: UpstreamClient,
    backoff: BackoffPolicy,
    events: EventHub,
    max_retries: u32,
    timeout: Duration,
    probe_upstream: bool,
    in_flight: DashMap<Uuid, RequestState>,
    model_stats: DashMap<String, ModelStats>,
    idle: Notify,
    cancel: watch::Sender<bool>,
    draining: AtomicBool,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Engine {
    /// Build an engine; refuses configurations without keys or models
    pub fn new(config: &Config, events: EventHub) -> Result<Self> {
        config.validate()?;

        let rotator = Rotator::new(
            config.proxy.api_keys.clone(),
            config.proxy.api_models.clone(),
            config.retry.rotation,
        )?
        .with_model_failure_limit(config.retry.model_failure_limit);
        let upstream = UpstreamClient::new(&config.proxy, &config.retry)?;
        let (cancel, _) = watch::channel(false);

        info!(
            keys = rotator.key_count(),
            models = rotator.model_count(),
            upstream = %upstream.base_url(),
            "Interception engine initialized"
        );

        Ok(Self {
            rotator,
            upstream,
            backoff: BackoffPolicy::from_config(&config.retry),
            events,
            max_retries: config.retry.max_retries.max(1),
            timeout: config.proxy.timeout(),
            probe_upstream: config.proxy.probe_upstream,
            in_flight: DashMap::new(),
            model_stats: DashMap::new(),
            idle: Notify::new(),
            cancel,
            draining: AtomicBool::new(false),
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn rotator(&self) -> &Rotator {
        &self.rotator
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Readiness: not draining and, if configured, the upstream answers
    pub async fn is_ready(&self) -> bool {
        if self.is_draining() {
            return false;
        }
        if !self.probe_upstream {
            return true;
        }
        self.upstream.probe(self.timeout.min(PROBE_TIMEOUT)).await
    }

    pub fn stats(&self) -> ProxyStats {
        let models = self
            .rotator
            .models()
            .iter()
            .enumerate()
            .map(|(index, model)| {
                let mut stats = self
                    .model_stats
                    .get(model)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_else(|| ModelStats::new(model));
                stats.dropped = self.rotator.is_model_dropped(index);
                stats
            })
            .collect();

        ProxyStats {
            total_requests: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
            retained: 0,
            key_count: self.rotator.key_count(),
            model_count: self.rotator.model_count(),
            key_index: 0,
            model_index: 0,
            models,
        }
        .with_rotation(self.rotator.state())
    }

    /// Run one inbound call and return the response head.
    ///
    /// The work happens on a spawned task so that dropping this future (the
    /// caller disconnecting) is observed by the task as a closed channel.
    pub async fn handle(self: &Arc<Self>, inbound: InboundRequest) -> Response<Body> {
        if self.is_draining() {
            return create_error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting_down",
                "Proxy is shutting down",
            );
        }

        let (head_tx, head_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(self).drive(inbound, head_tx));

        match head_rx.await {
            Ok(response) => response,
            Err(_) => create_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Request task ended without a response",
            ),
        }
    }

    /// Stop accepting calls and wait up to `grace` for in-flight ones.
    ///
    /// Returns `true` if everything finished in time; otherwise the
    /// remainder is cancelled.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + grace;

        loop {
            let idle = self.idle.notified();
            if self.in_flight.is_empty() {
                info!("All in-flight requests finished");
                return true;
            }
            info!(in_flight = self.in_flight.len(), "Waiting for in-flight requests");
            if timeout_at(deadline, idle).await.is_err() {
                break;
            }
        }

        warn!(
            remaining = self.in_flight.len(),
            "Shutdown grace period elapsed, cancelling in-flight requests"
        );
        self.cancel_all();
        false
    }

    /// Cancel every in-flight call
    pub fn cancel_all(&self) {
        self.cancel.send_replace(true);
    }

    async fn drive(self: Arc<Self>, inbound: InboundRequest, mut head_tx: HeadSender) {
        let mut record = InterceptedRequest::new(RequestSnapshot {
            method: inbound.method.to_string(),
            path: inbound.path.clone(),
            target_url: self.upstream.target_url(&inbound.upstream_path),
            headers: redact_headers(&inbound.headers),
            body: String::from_utf8_lossy(&inbound.body).into_owned(),
        });
        let id = record.id;
        let _guard = InFlightGuard::register(&self, id);
        self.total.fetch_add(1, Ordering::Relaxed);

        info!(
            request_id = %id,
            method = %inbound.method,
            path = %inbound.path,
            "Request received"
        );
        self.events.publish(ProxyEvent::RequestCaptured {
            record: record.clone(),
        });

        let request = UpstreamRequest::new(
            inbound.method,
            inbound.upstream_path,
            inbound.headers,
            inbound.body,
        );
        let mut cancel_rx = self.cancel.subscribe();

        match self
            .run_attempts(&mut record, &request, &mut head_tx, &mut cancel_rx)
            .await
        {
            Ok(response) => {
                let format = if response.is_event_stream() {
                    StreamFormat::Sse
                } else {
                    StreamFormat::Plain
                };
                let UpstreamResponse {
                    status,
                    headers,
                    body,
                    ..
                } = response;
                match body {
                    UpstreamBody::Buffered(body) => {
                        self.deliver_buffered(record, status, headers, body, head_tx);
                    }
                    UpstreamBody::Streaming(upstream) => {
                        self.deliver_stream(record, status, headers, format, upstream, head_tx, cancel_rx)
                            .await;
                    }
                }
            }
            Err((failure, exhausted)) => {
                let attempts = record.attempts;
                record.fail(&failure);
                self.finish(&record);
                let _ = head_tx.send(failure.into_response(id, attempts, exhausted));
            }
        }
    }

    /// The attempt loop. On failure returns the last failure and whether
    /// the retry budget was exhausted.
    async fn run_attempts(
        &self,
        record: &mut InterceptedRequest,
        request: &UpstreamRequest,
        head_tx: &mut HeadSender,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> std::result::Result<UpstreamResponse, (UpstreamFailure, bool)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let selection = self.rotator.acquire();
            record.begin_attempt(attempt, selection.key_index, &selection.model);
            self.set_state(record.id, RequestState::Attempting);
            self.events.publish(ProxyEvent::RequestUpdated {
                record: record.clone(),
            });
            debug!(
                request_id = %record.id,
                attempt,
                key_index = selection.key_index,
                model = %selection.model,
                "Starting upstream attempt"
            );

            let started = Instant::now();
            let result = tokio::select! {
                result = self.upstream.send(request, &selection.key, &selection.model, self.timeout) => result,
                _ = head_tx.closed() => Err(UpstreamFailure::cancelled(
                    "Client disconnected before the upstream responded",
                )),
                _ = cancelled(cancel_rx) => Err(UpstreamFailure::cancelled("Proxy shutting down")),
            };

            let failure = match result {
                Ok(response) => {
                    self.rotator.report_success();
                    self.record_model_attempt(&selection.model, true, started.elapsed());
                    info!(
                        request_id = %record.id,
                        attempt,
                        status = response.status,
                        streaming = response.is_streaming(),
                        "Upstream responded"
                    );
                    return Ok(response);
                }
                Err(failure) => failure,
            };

            let counted = failure.kind != FailureKind::Cancelled;
            if counted {
                self.record_model_attempt(&selection.model, false, started.elapsed());
            }

            if !failure.is_retryable() {
                if counted {
                    self.report_model_failure(selection.model_index, &selection.model);
                }
                return Err((failure, false));
            }

            self.rotator.report_failure();
            self.report_model_failure(selection.model_index, &selection.model);
            if attempt >= self.max_retries {
                warn!(
                    request_id = %record.id,
                    attempts = attempt,
                    kind = %failure.kind,
                    "Retries exhausted"
                );
                return Err((failure, true));
            }

            let wait = self.backoff.delay_for(&failure, attempt);
            warn!(
                request_id = %record.id,
                attempt,
                key_index = selection.key_index,
                model = %selection.model,
                kind = %failure.kind,
                wait_ms = wait.as_millis() as u64,
                "Attempt failed, rotating and retrying"
            );
            self.events.publish(ProxyEvent::RetryScheduled(RetryAttempt {
                request_id: record.id,
                attempt,
                key_index: selection.key_index,
                model: selection.model,
                outcome: AttemptOutcome::Retryable,
                kind: Some(failure.kind),
                wait_ms: wait.as_millis() as u64,
            }));

            let interrupted = tokio::select! {
                _ = tokio::time::sleep(wait) => None,
                _ = head_tx.closed() => Some("Client disconnected while waiting to retry"),
                _ = cancelled(cancel_rx) => Some("Proxy shutting down"),
            };
            if let Some(reason) = interrupted {
                return Err((UpstreamFailure::cancelled(reason), false));
            }
        }
    }

    fn deliver_buffered(
        &self,
        mut record: InterceptedRequest,
        status: u16,
        headers: HeaderMap,
        body: Bytes,
        head_tx: HeadSender,
    ) {
        if head_tx.is_closed() {
            record.fail(&UpstreamFailure::cancelled(
                "Client disconnected before the response was delivered",
            ));
            self.finish(&record);
            return;
        }

        record.complete_buffered(status, &headers, &body);
        self.finish(&record);
        let _ = head_tx.send(build_response(status, headers, Body::from(body)));
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_stream(
        &self,
        mut record: InterceptedRequest,
        status: u16,
        headers: HeaderMap,
        format: StreamFormat,
        upstream: reqwest::Response,
        head_tx: HeadSender,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        record.begin_streaming(status, &headers);
        self.set_state(record.id, RequestState::Streaming);
        self.events.publish(ProxyEvent::RequestUpdated {
            record: record.clone(),
        });

        let (tx, rx): (ChunkSender, _) = mpsc::channel(STREAM_BUFFER);
        let body = Body::from_stream(ReceiverStream::new(rx));
        if head_tx.send(build_response(status, headers, body)).is_err() {
            record.fail(&UpstreamFailure::cancelled(
                "Client disconnected before streaming started",
            ));
            self.finish(&record);
            return;
        }

        let mut accumulator = StreamAccumulator::new(format);
        let mut chunks = Box::pin(upstream.bytes_stream());

        let cancellation = loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.timeout, chunks.next()) => next,
                _ = tx.closed() => break client_gone(&accumulator),
                _ = cancelled(&mut cancel_rx) => break Some(UpstreamFailure::cancelled("Proxy shutting down")),
            };

            match next {
                Ok(Some(Ok(bytes))) => {
                    record.mark_first_byte();
                    let update = accumulator.feed(&bytes);
                    record.apply_update(&bytes, &update);
                    if update.is_meaningful() {
                        self.events.publish(ProxyEvent::StreamDelta(StreamDelta {
                            request_id: record.id,
                            delta: update.delta,
                            content_len: update.content_len,
                            chunk_count: update.chunk_count,
                            usage: update.usage,
                            parse_skips: update.parse_skips,
                            done: update.done,
                        }));
                    }
                    // A caller that stops reading fills the channel; shutdown
                    // must still be able to reach this task.
                    let delivered = tokio::select! {
                        sent = tx.send(Ok(bytes)) => sent.is_ok(),
                        _ = cancelled(&mut cancel_rx) => break Some(UpstreamFailure::cancelled("Proxy shutting down")),
                    };
                    if !delivered {
                        break client_gone(&accumulator);
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(request_id = %record.id, error = %e, "Upstream stream interrupted");
                    accumulator.mark_interrupted();
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break None;
                }
                Ok(None) => break None,
                Err(_) => {
                    warn!(
                        request_id = %record.id,
                        idle_secs = self.timeout.as_secs_f64(),
                        "Upstream stream idle too long"
                    );
                    accumulator.mark_interrupted();
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "upstream stream idle timeout",
                        )))
                        .await;
                    break None;
                }
            }
        };

        match cancellation {
            Some(failure) => record.fail(&failure),
            None => record.complete_stream(accumulator.finish()),
        }
        self.finish(&record);
    }

    fn finish(&self, record: &InterceptedRequest) {
        match record.state {
            RequestState::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    request_id = %record.id,
                    attempts = record.attempts,
                    status = record.response.as_ref().map(|r| r.status),
                    duration_ms = record.duration_ms,
                    "Request completed"
                );
            }
            RequestState::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let kind = record.error.as_ref().map(|e| e.kind);
                if kind == Some(FailureKind::Cancelled) {
                    warn!(request_id = %record.id, "Request cancelled");
                } else {
                    error!(
                        request_id = %record.id,
                        attempts = record.attempts,
                        kind = ?kind,
                        "Request failed"
                    );
                }
            }
            _ => {}
        }
        self.set_state(record.id, record.state);
        self.events.publish(ProxyEvent::RequestFinished {
            record: record.clone(),
        });
    }

    fn record_model_attempt(&self, model: &str, success: bool, latency: Duration) {
        self.model_stats
            .entry(model.to_string())
            .or_insert_with(|| ModelStats::new(model))
            .record(success, latency);
    }

    fn report_model_failure(&self, model_index: usize, model: &str) {
        if self.rotator.report_model_failure(model_index) {
            warn!(model = %model, "Model dropped from rotation after repeated failures");
        }
    }

    fn set_state(&self, id: Uuid, state: RequestState) {
        if let Some(mut entry) = self.in_flight.get_mut(&id) {
            *entry = state;
        }
    }
}

/// The caller stopped reading. A stream that already saw `[DONE]` counts as
/// delivered.
fn client_gone(accumulator: &StreamAccumulator) -> Option<UpstreamFailure> {
    if accumulator.is_done() {
        None
    } else {
        Some(UpstreamFailure::cancelled("Client disconnected during streaming"))
    }
}

/// Resolves once a cancel-all has been signalled
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn build_response(status: u16, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers;
    response
}

/// Keeps a request in the in-flight registry while it is being driven
struct InFlightGuard<'a> {
    engine: &'a Engine,
    id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn register(engine: &'a Engine, id: Uuid) -> Self {
        engine.in_flight.insert(id, RequestState::Received);
        Self { engine, id }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.engine.in_flight.remove(&self.id);
        if self.engine.in_flight.is_empty() {
            self.engine.idle.notify_waiters();
        }
    }
}
