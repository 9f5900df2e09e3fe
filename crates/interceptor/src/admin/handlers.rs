use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{Response, StatusCode},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::admin::ProxyStats;
use crate::proxy::capture::InterceptedRequest;
use crate::proxy::{AppState, create_error_response};

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.engine.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => {
                let json = serde_json::to_string(&event).ok()?;
                Some(Ok(Event::default().data(json)))
            }
            Err(e) => {
                tracing::debug!("Event subscriber lagged: {e}");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<ProxyStats> {
    let mut stats = state.engine.stats();
    stats.retained = state.log.len();
    Json(stats)
}

#[derive(Debug, Deserialize, Default)]
pub struct RequestsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RequestsResponse {
    pub requests: Vec<InterceptedRequest>,
    pub total: usize,
    pub capacity: usize,
}

/// Retained records, oldest first
pub async fn list_requests_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RequestsQuery>,
) -> Json<RequestsResponse> {
    let requests = state.log.snapshot(query.limit);
    Json(RequestsResponse {
        total: state.log.len(),
        capacity: state.log.capacity(),
        requests,
    })
}

pub async fn get_request_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response<Body> {
    match state.log.get(id) {
        Some(record) => Json(record).into_response(),
        None => create_error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("No retained request with id {id}"),
        ),
    }
}

pub async fn clear_requests_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.log.clear();
    tracing::info!("Cleared retained requests");
    StatusCode::NO_CONTENT
}
