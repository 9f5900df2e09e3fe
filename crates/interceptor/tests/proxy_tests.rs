//! Integration tests for the HTTP front-end
//!
//! Exercises the router end to end: forwarding with rewritten credentials
//! and model, prefix handling, and the admin endpoints fed by the request log.

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

use interceptor_server::config::Config;
use interceptor_server::proxy::{AppState, create_router};
use interceptor_server::testing::{chat_request, completion_body, sse_body, test_config};

// =============================================================================
// Test Fixtures
// =============================================================================

fn create_test_state(config: &Config) -> Arc<AppState> {
    AppState::new(config).unwrap()
}

fn chat_post(uri: &str, stream: bool) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer client-token")
        .body(Body::from(chat_request(stream).to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// The request log consumes events on a background task
async fn wait_for_retained(state: &AppState, count: usize) {
    for _ in 0..100 {
        if state.log.len() >= count
            && state.engine.in_flight() == 0
            && state
                .log
                .snapshot(None)
                .iter()
                .all(|record| record.is_terminal())
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request log never caught up");
}

// =============================================================================
// Forwarding Tests
// =============================================================================

mod forwarding_tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_with_rotated_key_and_model() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/v1/chat/completions"))
            .and(matchers::header("authorization", "Bearer sk-rotated"))
            .and(matchers::header("x-title", "Interceptor"))
            .and(matchers::header_exists("http-referer"))
            .and(matchers::body_partial_json(serde_json::json!({"model": "vendor/model-a"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Hi!")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let base = format!("{}/api/v1", mock_server.uri());
        let config = test_config(&base, &["sk-rotated"], &["vendor/model-a"]);
        let app = create_router(create_test_state(&config));

        let response = app
            .oneshot(chat_post("/v1/chat/completions", false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["choices"][0]["message"]["content"], "Hi!");
    }

    #[tokio::test]
    async fn test_query_string_is_preserved() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/models"))
            .and(matchers::query_param("supported_parameters", "tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["k1"], &["m1"]);
        let app = create_router(create_test_state(&config));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models?supported_parameters=tools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut config = test_config(&mock_server.uri(), &["k1"], &["m1"]);
        config.proxy.route_prefix = "/openai/".to_string();
        let app = create_router(create_test_state(&config));

        let response = app
            .clone()
            .oneshot(chat_post("/openai/chat/completions", false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(chat_post("/v1/chat/completions", false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_streaming_passthrough_preserves_bytes() {
        let mock_server = MockServer::start().await;
        let body = sse_body(&["one ", "two"]);

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.clone(), "text/event-stream"))
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["k1"], &["m1"]);
        let state = create_test_state(&config);
        let app = create_router(Arc::clone(&state));

        let response = app
            .oneshot(chat_post("/v1/chat/completions", true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), body);

        wait_for_retained(&state, 1).await;
        let record = state.log.snapshot(None).pop().unwrap();
        assert_eq!(record.response.unwrap().content, "one two");
    }
}

// =============================================================================
// Admin Endpoint Tests
// =============================================================================

mod admin_tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_endpoint_lists_redacted_records() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("logged")))
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["k1"], &["m1"]);
        let state = create_test_state(&config);
        let app = create_router(Arc::clone(&state));

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(chat_post("/v1/chat/completions", false))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        wait_for_retained(&state, 3).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/requests?limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["total"], 3);
        let requests = json["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 2);

        let record = &requests[0];
        assert_eq!(record["state"], "completed");
        assert_eq!(record["request"]["headers"]["authorization"], "Bearer ****");
        assert_eq!(record["response"]["content"], "logged");
        assert_eq!(record["model"], "m1");

        let id = record["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/admin/requests/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/requests")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.log.is_empty());
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["k1", "k2"], &["m1", "m2", "m3"]);
        let state = create_test_state(&config);
        let app = create_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(chat_post("/v1/chat/completions", false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        wait_for_retained(&state, 1).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = json_body(response).await;

        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["completed"], 1);
        assert_eq!(json["failed"], 0);
        assert_eq!(json["in_flight"], 0);
        assert_eq!(json["retained"], 1);
        assert_eq!(json["key_count"], 2);
        assert_eq!(json["model_count"], 3);
        assert_eq!(json["key_index"], 1);
        assert_eq!(json["model_index"], 1);

        let models = json["models"].as_array().unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0]["model"], "m1");
        assert_eq!(models[0]["failures"], 1);
        assert_eq!(models[1]["model"], "m2");
        assert_eq!(models[1]["successes"], 1);
        assert_eq!(models[2]["requests"], 0);
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_not_found() {
        let config = test_config("http://127.0.0.1:9", &["k1"], &["m1"]);
        let app = create_router(create_test_state(&config));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/admin/requests/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
