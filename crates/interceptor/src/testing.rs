//! Test utilities for interceptor - config builders and SSE fixtures
//!
//! Shared by unit tests and the integration tests under `tests/`.

use serde_json::{Value, json};

use crate::config::Config;

/// SSE end-of-stream line
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// A valid config pointing at `base_url`, tuned for fast tests:
/// short timeouts, tiny deterministic backoff and three attempts.
pub fn test_config(base_url: &str, keys: &[&str], models: &[&str]) -> Config {
    let mut config = Config::default();
    config.proxy.target_base_url = base_url.to_string();
    config.proxy.api_keys = keys.iter().map(|k| k.to_string()).collect();
    config.proxy.api_models = models.iter().map(|m| m.to_string()).collect();
    config.proxy.timeout_seconds = 5.0;
    config.proxy.connect_timeout_seconds = 2.0;
    config.proxy.shutdown_grace_seconds = 1;
    config.retry.max_retries = 3;
    config.retry.backoff_base_seconds = 0.01;
    config.retry.backoff_max_seconds = 0.05;
    config.retry.jitter = false;
    config
}

/// One SSE `data:` event carrying `payload`
pub fn sse_event(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

/// An OpenAI-style streaming chunk carrying `text`
pub fn content_chunk(text: &str) -> String {
    sse_event(&json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    }))
}

/// A full SSE body streaming `parts` and ending with `[DONE]`
pub fn sse_body(parts: &[&str]) -> String {
    let mut body: String = parts.iter().map(|part| content_chunk(part)).collect();
    body.push_str(SSE_DONE);
    body
}

/// A buffered chat completion response
pub fn completion_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
    })
}

/// A chat completion request as a client would send it
pub fn chat_request(stream: bool) -> Value {
    json!({
        "model": "client-placeholder",
        "stream": stream,
        "messages": [{"role": "user", "content": "Say hello"}]
    })
}
