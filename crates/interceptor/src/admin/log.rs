//! Bounded in-memory history of intercepted requests

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use super::{EventHub, ProxyEvent};
use crate::proxy::capture::InterceptedRequest;

/// Keeps the most recent `capacity` records, oldest evicted first
#[derive(Debug)]
pub struct RequestLog {
    capacity: usize,
    records: RwLock<VecDeque<InterceptedRequest>>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Subscribe to `hub` and fold every event into the log on a background task
    pub fn attach(self: &Arc<Self>, hub: &EventHub) -> JoinHandle<()> {
        let mut rx = hub.subscribe();
        let log = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log.apply(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Request log fell behind the event feed");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn apply(&self, event: &ProxyEvent) {
        match event {
            ProxyEvent::RequestCaptured { record }
            | ProxyEvent::RequestUpdated { record }
            | ProxyEvent::RequestFinished { record } => self.upsert(record.clone()),
            ProxyEvent::StreamDelta(delta) => {
                let mut records = self.records.write();
                if let Some(existing) = records.iter_mut().rev().find(|r| r.id == delta.request_id) {
                    existing.apply_delta(delta);
                }
            }
            ProxyEvent::RetryScheduled(_) => {}
        }
    }

    fn upsert(&self, record: InterceptedRequest) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.write();
        if let Some(existing) = records.iter_mut().rev().find(|r| r.id == record.id) {
            // A late non-terminal snapshot must not overwrite a finished one.
            if !existing.is_terminal() {
                *existing = record;
            }
            return;
        }
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Retained records, oldest first; `limit` keeps only the newest ones
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<InterceptedRequest> {
        let records = self.records.read();
        let skip = limit.map_or(0, |limit| records.len().saturating_sub(limit));
        records.iter().skip(skip).cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<InterceptedRequest> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
