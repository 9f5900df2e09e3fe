use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{InterceptorError, Result};

/// Maximum accepted length for a single API key
const MAX_KEY_LEN: usize = 512;

/// Longest duration any `*_seconds` setting may hold (one day)
pub const MAX_DURATION_SECONDS: f64 = 86_400.0;

/// Seconds to a [`Duration`], clamped to `0..=MAX_DURATION_SECONDS`.
/// Non-finite input maps to zero.
pub fn duration_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.clamp(0.0, MAX_DURATION_SECONDS)).unwrap_or_default()
}

/// Main configuration structure for Interceptor
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Listener, upstream and credential pool configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Retry, backoff and rotation configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Traffic capture and notification configuration
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    /// Parse a TOML document into a configuration (not yet validated)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| InterceptorError::Config(format!("Failed to parse config: {e}")))
    }

    /// Read and parse a TOML configuration file (not yet validated)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            InterceptorError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Append keys found in the `api_keys_env` variable, using `lookup` to read it
    pub fn resolve_env_keys_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(ref var) = self.proxy.api_keys_env else {
            return;
        };

        if let Some(raw) = lookup(var) {
            let before = self.proxy.api_keys.len();
            for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if !self.proxy.api_keys.iter().any(|existing| existing == key) {
                    self.proxy.api_keys.push(key.to_string());
                }
            }
            tracing::debug!(
                "Loaded {} additional API keys from ${}",
                self.proxy.api_keys.len() - before,
                var
            );
        }
    }

    /// Append keys from the process environment
    pub fn resolve_env_keys(&mut self) {
        self.resolve_env_keys_with(|name| std::env::var(name).ok());
    }

    /// Check every invariant the engine relies on.
    ///
    /// At least one key and one model must be configured before traffic is accepted.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.retry.validate()?;
        self.capture.validate()?;
        Ok(())
    }
}

/// HTTP proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream API base URL; inbound paths are appended to it
    #[serde(default = "default_target_base_url")]
    pub target_base_url: String,
    /// Inbound path prefix handled by the catch-all route
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
    /// Ordered pool of upstream API keys
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Environment variable holding extra comma-separated keys
    #[serde(default)]
    pub api_keys_env: Option<String>,
    /// Ordered pool of model identifiers
    #[serde(default = "default_api_models")]
    pub api_models: Vec<String>,
    /// Budget for a single upstream attempt, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// TCP/TLS connect timeout, in seconds
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: f64,
    /// Sent upstream as `HTTP-Referer`
    #[serde(default)]
    pub site_url: Option<String>,
    /// Sent upstream as `X-Title`
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Probe the upstream base URL before reporting ready
    #[serde(default)]
    pub probe_upstream: bool,
    /// How long in-flight requests may run after a shutdown signal
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            target_base_url: default_target_base_url(),
            route_prefix: default_route_prefix(),
            api_keys: Vec::new(),
            api_keys_env: None,
            api_models: default_api_models(),
            timeout_seconds: default_timeout_seconds(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            site_url: None,
            app_name: default_app_name(),
            probe_upstream: false,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl ProxyConfig {
    /// `host:port` string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        duration_from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        duration_from_secs(self.connect_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Referer sent upstream, defaulting to the local listener address
    pub fn referer(&self) -> String {
        self.site_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }

    /// Normalized prefix: leading slash, no trailing slash ("" for the root)
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.route_prefix.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    fn validate(&self) -> Result<()> {
        if self.api_keys.is_empty() {
            return Err(InterceptorError::Config(
                "No API keys configured; add at least one to proxy.api_keys".to_string(),
            ));
        }
        for (index, key) in self.api_keys.iter().enumerate() {
            validate_api_key(key)
                .map_err(|reason| InterceptorError::Config(format!("API key #{index}: {reason}")))?;
        }

        if self.api_models.is_empty() {
            return Err(InterceptorError::Config(
                "No models configured; add at least one to proxy.api_models".to_string(),
            ));
        }
        for model in &self.api_models {
            if model.trim().is_empty() || model.chars().any(char::is_whitespace) {
                return Err(InterceptorError::Config(format!(
                    "Invalid model identifier '{model}'"
                )));
            }
        }

        let url = Url::parse(&self.target_base_url).map_err(|e| {
            InterceptorError::Config(format!(
                "Invalid target_base_url '{}': {e}",
                self.target_base_url
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(InterceptorError::Config(format!(
                "Unsupported target_base_url scheme '{}': only http and https are allowed",
                url.scheme()
            )));
        }

        for (name, value) in [
            ("timeout_seconds", self.timeout_seconds),
            ("connect_timeout_seconds", self.connect_timeout_seconds),
        ] {
            if !(value.is_finite() && value > 0.0 && value <= MAX_DURATION_SECONDS) {
                return Err(InterceptorError::Config(format!(
                    "{name} must be positive and at most {MAX_DURATION_SECONDS} seconds"
                )));
            }
        }
        if self.shutdown_grace_seconds as f64 > MAX_DURATION_SECONDS {
            return Err(InterceptorError::Config(format!(
                "shutdown_grace_seconds must be at most {MAX_DURATION_SECONDS} seconds"
            )));
        }

        Ok(())
    }
}

/// Format check for a single API key
fn validate_api_key(key: &str) -> std::result::Result<(), String> {
    if key.trim().is_empty() {
        return Err("key is empty".to_string());
    }
    if key.len() > MAX_KEY_LEN {
        return Err(format!("key is longer than {MAX_KEY_LEN} bytes"));
    }
    if key
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || !c.is_ascii())
    {
        return Err("key contains whitespace, control or non-ASCII characters".to_string());
    }
    Ok(())
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_target_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_route_prefix() -> String {
    "/v1".to_string()
}

fn default_api_models() -> Vec<String> {
    vec![
        "qwen/qwen3-coder:free".to_string(),
        "openai/gpt-oss-20b:free".to_string(),
    ]
}

fn default_timeout_seconds() -> f64 {
    60.0
}

fn default_connect_timeout_seconds() -> f64 {
    10.0
}

fn default_app_name() -> String {
    "Interceptor".to_string()
}

fn default_shutdown_grace_seconds() -> u64 {
    10
}

/// When the rotator moves to the next key/model pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    /// Advance both axes on every retryable failure
    #[default]
    PerFailure,
    /// Advance the key on every request and both axes on failure
    RoundRobin,
    /// Advance only after this many consecutive failures on the current pair
    AfterFailures(u32),
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts the engine makes per request (rotation retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Attempts the upstream adapter makes within a single engine attempt
    #[serde(default = "default_call_attempts")]
    pub call_attempts: u32,
    /// First backoff step, in seconds
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: f64,
    /// Ceiling for exponential backoff, in seconds
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: f64,
    /// Ceiling applied to upstream `Retry-After` values, in seconds
    #[serde(default = "default_retry_after_max_seconds")]
    pub retry_after_max_seconds: f64,
    /// Randomize exponential backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Rotation policy
    #[serde(default)]
    pub rotation: RotationPolicy,
    /// Skip a model once it has failed more than this many times (0 keeps every model)
    #[serde(default)]
    pub model_failure_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            call_attempts: default_call_attempts(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_max_seconds: default_backoff_max_seconds(),
            retry_after_max_seconds: default_retry_after_max_seconds(),
            jitter: default_jitter(),
            rotation: RotationPolicy::default(),
            model_failure_limit: 0,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(InterceptorError::Config(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.call_attempts == 0 {
            return Err(InterceptorError::Config(
                "retry.call_attempts must be at least 1".to_string(),
            ));
        }
        if let RotationPolicy::AfterFailures(0) = self.rotation {
            return Err(InterceptorError::Config(
                "retry.rotation.after_failures must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("backoff_max_seconds", self.backoff_max_seconds),
            ("retry_after_max_seconds", self.retry_after_max_seconds),
        ] {
            if !(value.is_finite() && (0.0..=MAX_DURATION_SECONDS).contains(&value)) {
                return Err(InterceptorError::Config(format!(
                    "retry.{name} must be between 0 and {MAX_DURATION_SECONDS} seconds"
                )));
            }
        }
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_call_attempts() -> u32 {
    1
}

fn default_backoff_base_seconds() -> f64 {
    0.5
}

fn default_backoff_max_seconds() -> f64 {
    30.0
}

fn default_retry_after_max_seconds() -> f64 {
    60.0
}

fn default_jitter() -> bool {
    true
}

/// Traffic capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Retain intercepted records in the in-memory request log
    #[serde(default = "default_log_requests")]
    pub log_requests: bool,
    /// Ring size of the request log
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// Capacity of the broadcast notification channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            log_requests: default_log_requests(),
            max_requests: default_max_requests(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl CaptureConfig {
    fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(InterceptorError::Config(
                "capture.event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_requests() -> bool {
    true
}

fn default_max_requests() -> usize {
    1000
}

fn default_event_buffer() -> usize {
    1024
}
