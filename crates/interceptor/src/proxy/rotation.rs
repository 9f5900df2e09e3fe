//! Credential and model rotation
//!
//! Hands out the current `(key, model)` pair and cycles through both pools
//! on failure. The index pair is the only mutable state shared between
//! concurrent requests; it lives behind a mutex that is held only for the
//! duration of an index read or update.

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::RotationPolicy;
use crate::error::{InterceptorError, Result};

/// A key/model pair chosen for one upstream attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Index of the key within the key pool
    pub key_index: usize,
    /// The API key itself
    pub key: String,
    /// Index of the model within the model pool
    pub model_index: usize,
    /// The model identifier
    pub model: String,
}

/// Snapshot of the rotation indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RotationState {
    pub key_index: usize,
    pub model_index: usize,
}

#[derive(Debug, Default)]
struct Indices {
    key: usize,
    model: usize,
    consecutive_failures: u32,
    /// Failures per model, counted only when a failure limit is set
    model_failures: Vec<u32>,
    /// Models taken out of rotation after exceeding the failure limit
    dropped: Vec<bool>,
}

/// Round-robin rotator over the configured key and model pools
#[derive(Debug)]
pub struct Rotator {
    keys: Vec<String>,
    models: Vec<String>,
    policy: RotationPolicy,
    /// Failures after which a model is skipped; 0 keeps every model
    model_failure_limit: u32,
    state: Mutex<Indices>,
}

impl Rotator {
    /// Build a rotator; both pools must be non-empty
    pub fn new(keys: Vec<String>, models: Vec<String>, policy: RotationPolicy) -> Result<Self> {
        if keys.is_empty() {
            return Err(InterceptorError::Config(
                "Rotator requires at least one API key".to_string(),
            ));
        }
        if models.is_empty() {
            return Err(InterceptorError::Config(
                "Rotator requires at least one model".to_string(),
            ));
        }

        let state = Indices {
            model_failures: vec![0; models.len()],
            dropped: vec![false; models.len()],
            ..Indices::default()
        };

        Ok(Self {
            keys,
            models,
            policy,
            model_failure_limit: 0,
            state: Mutex::new(state),
        })
    }

    /// Skip a model once it has failed more than `limit` times (0 disables)
    pub fn with_model_failure_limit(mut self, limit: u32) -> Self {
        self.model_failure_limit = limit;
        self
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// The model pool in rotation order
    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// The pair at the current indices
    pub fn current(&self) -> (String, String) {
        let state = self.state.lock();
        (
            self.keys[state.key].clone(),
            self.models[state.model].clone(),
        )
    }

    /// Current indices without the secrets
    pub fn state(&self) -> RotationState {
        let state = self.state.lock();
        RotationState {
            key_index: state.key,
            model_index: state.model,
        }
    }

    /// Move both axes one step forward, independently.
    ///
    /// A pool of size one stays where it is.
    pub fn advance(&self) {
        let mut state = self.state.lock();
        self.step(&mut state);
    }

    /// Pick the pair for the next attempt, applying the policy's per-request step
    pub fn acquire(&self) -> Selection {
        let mut state = self.state.lock();
        let selection = Selection {
            key_index: state.key,
            key: self.keys[state.key].clone(),
            model_index: state.model,
            model: self.models[state.model].clone(),
        };

        if self.policy == RotationPolicy::RoundRobin {
            state.key = (state.key + 1) % self.keys.len();
        }

        selection
    }

    /// Record a retryable failure; returns whether the rotator advanced
    pub fn report_failure(&self) -> bool {
        let mut state = self.state.lock();
        match self.policy {
            RotationPolicy::PerFailure => {
                self.step(&mut state);
                true
            }
            // The key axis already moved when the failed attempt acquired its pair
            RotationPolicy::RoundRobin => {
                self.step_model(&mut state);
                true
            }
            RotationPolicy::AfterFailures(threshold) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= threshold {
                    state.consecutive_failures = 0;
                    self.step(&mut state);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful attempt
    pub fn report_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    /// Count a failure against one model. Returns `true` when this failure
    /// takes the model out of rotation.
    ///
    /// The last model still in rotation is never dropped.
    pub fn report_model_failure(&self, model_index: usize) -> bool {
        if self.model_failure_limit == 0 || model_index >= self.models.len() {
            return false;
        }

        let mut state = self.state.lock();
        state.model_failures[model_index] = state.model_failures[model_index].saturating_add(1);
        if state.dropped[model_index] || state.model_failures[model_index] <= self.model_failure_limit {
            return false;
        }
        if state.dropped.iter().filter(|dropped| !**dropped).count() <= 1 {
            return false;
        }

        state.dropped[model_index] = true;
        if state.model == model_index {
            self.step_model(&mut state);
        }
        true
    }

    /// Whether the model at `model_index` has been taken out of rotation
    pub fn is_model_dropped(&self, model_index: usize) -> bool {
        self.state
            .lock()
            .dropped
            .get(model_index)
            .copied()
            .unwrap_or(false)
    }

    fn step(&self, state: &mut Indices) {
        state.key = (state.key + 1) % self.keys.len();
        self.step_model(state);
    }

    /// Next model index, skipping dropped models
    fn step_model(&self, state: &mut Indices) {
        let count = self.models.len();
        for offset in 1..=count {
            let candidate = (state.model + offset) % count;
            if !state.dropped[candidate] {
                state.model = candidate;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools(keys: &[&str], models: &[&str]) -> (Vec<String>, Vec<String>) {
        (
            keys.iter().map(|k| k.to_string()).collect(),
            models.iter().map(|m| m.to_string()).collect(),
        )
    }

    #[test]
    fn test_new_rejects_empty_pools() {
        let (keys, models) = pools(&[], &["m1"]);
        assert!(Rotator::new(keys, models, RotationPolicy::PerFailure).is_err());

        let (keys, models) = pools(&["k1"], &[]);
        assert!(Rotator::new(keys, models, RotationPolicy::PerFailure).is_err());
    }

    #[test]
    fn test_current_starts_at_first_pair() {
        let (keys, models) = pools(&["k1", "k2"], &["m1", "m2", "m3"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure).unwrap();
        assert_eq!(rotator.current(), ("k1".to_string(), "m1".to_string()));
    }

    #[test]
    fn test_advance_cycles_axes_independently() {
        let (keys, models) = pools(&["k1", "k2"], &["m1", "m2", "m3"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure).unwrap();

        rotator.advance();
        assert_eq!(rotator.current(), ("k2".to_string(), "m2".to_string()));
        rotator.advance();
        assert_eq!(rotator.current(), ("k1".to_string(), "m3".to_string()));
        rotator.advance();
        assert_eq!(rotator.current(), ("k2".to_string(), "m1".to_string()));
    }

    #[test]
    fn test_single_element_pools_never_move() {
        let (keys, models) = pools(&["only"], &["one"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure).unwrap();
        for _ in 0..5 {
            rotator.advance();
        }
        assert_eq!(
            rotator.state(),
            RotationState {
                key_index: 0,
                model_index: 0
            }
        );
    }

    #[test]
    fn test_acquire_does_not_advance_under_per_failure() {
        let (keys, models) = pools(&["k1", "k2"], &["m1"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure).unwrap();
        assert_eq!(rotator.acquire().key, "k1");
        assert_eq!(rotator.acquire().key, "k1");
        assert!(rotator.report_failure());
        assert_eq!(rotator.acquire().key, "k2");
    }

    #[test]
    fn test_round_robin_moves_key_per_request() {
        let (keys, models) = pools(&["k1", "k2", "k3"], &["m1", "m2"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::RoundRobin).unwrap();

        let picked: Vec<String> = (0..4).map(|_| rotator.acquire().key).collect();
        assert_eq!(picked, vec!["k1", "k2", "k3", "k1"]);
        assert_eq!(rotator.state().model_index, 0);
    }

    #[test]
    fn test_round_robin_failure_reaches_next_key() {
        let (keys, models) = pools(&["k1", "k2"], &["m1", "m2"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::RoundRobin).unwrap();

        let first = rotator.acquire();
        assert!(rotator.report_failure());
        let second = rotator.acquire();
        assert!(rotator.report_failure());
        let third = rotator.acquire();

        assert_eq!((first.key.as_str(), first.model.as_str()), ("k1", "m1"));
        assert_eq!((second.key.as_str(), second.model.as_str()), ("k2", "m2"));
        assert_eq!((third.key.as_str(), third.model.as_str()), ("k1", "m1"));
    }

    #[test]
    fn test_model_failure_limit_drops_model() {
        let (keys, models) = pools(&["k1"], &["m1", "m2", "m3"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure)
            .unwrap()
            .with_model_failure_limit(2);

        assert!(!rotator.report_model_failure(1));
        assert!(!rotator.report_model_failure(1));
        assert!(rotator.report_model_failure(1));
        assert!(rotator.is_model_dropped(1));

        rotator.advance();
        assert_eq!(rotator.state().model_index, 2);
        rotator.advance();
        assert_eq!(rotator.state().model_index, 0);
    }

    #[test]
    fn test_model_failure_limit_moves_off_current_model() {
        let (keys, models) = pools(&["k1"], &["m1", "m2"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::AfterFailures(10))
            .unwrap()
            .with_model_failure_limit(1);

        rotator.report_model_failure(0);
        assert!(rotator.report_model_failure(0));
        assert_eq!(rotator.current().1, "m2");
    }

    #[test]
    fn test_last_model_is_never_dropped() {
        let (keys, models) = pools(&["k1"], &["m1", "m2"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure)
            .unwrap()
            .with_model_failure_limit(1);

        rotator.report_model_failure(0);
        assert!(rotator.report_model_failure(0));
        for _ in 0..5 {
            assert!(!rotator.report_model_failure(1));
        }
        assert!(!rotator.is_model_dropped(1));
        assert_eq!(rotator.current().1, "m2");
    }

    #[test]
    fn test_model_failures_ignored_without_limit() {
        let (keys, models) = pools(&["k1"], &["m1", "m2"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::PerFailure).unwrap();
        for _ in 0..20 {
            assert!(!rotator.report_model_failure(0));
        }
        assert!(!rotator.is_model_dropped(0));
    }

    #[test]
    fn test_after_failures_threshold() {
        let (keys, models) = pools(&["k1", "k2"], &["m1", "m2"]);
        let rotator = Rotator::new(keys, models, RotationPolicy::AfterFailures(2)).unwrap();

        assert!(!rotator.report_failure());
        assert_eq!(rotator.state().key_index, 0);
        assert!(rotator.report_failure());
        assert_eq!(rotator.state().key_index, 1);
        assert_eq!(rotator.state().model_index, 1);

        assert!(!rotator.report_failure());
        rotator.report_success();
        assert!(!rotator.report_failure());
        assert_eq!(rotator.state().key_index, 1);
    }
}
