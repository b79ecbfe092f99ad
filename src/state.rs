//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by every HTTP
//! handler and every WebSocket actor simultaneously.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to share ownership of data
//! - **Why needed**: Many connections run at once and all use the same pipeline
//! - **Memory safety**: The data is dropped when the last reference goes away
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **Why needed**: Many requests read config, only `PUT /api/v1/config` writes it
//!
//! ### Poisoned locks
//! A lock is "poisoned" when a thread panics while holding it. The counters
//! and config stay internally consistent even then, so we recover the guard
//! with `PoisonError::into_inner` instead of propagating the panic.
//!
//! ## What lives here:
//! - **config**: live configuration, snapshotted per connection and per request
//! - **metrics**: request, session and utterance counters for `/api/v1/metrics`
//! - **pipeline**: the stateless conversation pipeline, shared by every connection

use crate::config::AppConfig;
use crate::conversation::{ConversationPipeline, PipelineError, UtteranceOutcome};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all handlers and actors.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning only bumps the `Arc` counts
/// - **No Debug**: the pipeline holds trait objects for the upstream clients
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by middleware, sessions and the one-shot endpoint
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Transcription → generation → storage → synthesis
    pub pipeline: Arc<ConversationPipeline>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of HTTP requests that ended in an error status
    pub error_count: u64,

    /// Current number of open device WebSocket sessions
    pub active_sessions: u32,

    /// Utterances that produced a reply (including fallback replies)
    pub utterances_processed: u64,

    /// Replies where the model output failed validation
    pub fallback_replies: u64,

    /// Replies delivered without the history write succeeding
    pub unpersisted_replies: u64,

    /// Utterances that failed in the pipeline
    pub pipeline_failures: u64,

    /// Utterances rejected before reaching the pipeline
    pub rejected_utterances: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState around a ready pipeline.
    pub fn new(config: AppConfig, pipeline: Arc<ConversationPipeline>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline,
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a long-running utterance
    /// never blocks a config update.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration if it passes validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a session slot if fewer than `max` are open.
    ///
    /// Check and increment happen under one write lock, so concurrent
    /// upgrades can never overshoot the cap.
    pub fn try_acquire_session(&self, max: usize) -> bool {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= max {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Give back a slot taken by [`AppState::try_acquire_session`].
    pub fn release_session(&self) {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Fold one pipeline result into the utterance counters.
    pub fn record_utterance(&self, result: &Result<UtteranceOutcome, PipelineError>) {
        let mut metrics = self.write_metrics();
        match result {
            Ok(outcome) => {
                metrics.utterances_processed += 1;
                if outcome.used_fallback() {
                    metrics.fallback_replies += 1;
                }
                if !outcome.persisted {
                    metrics.unpersisted_replies += 1;
                }
            }
            Err(_) => metrics.pipeline_failures += 1,
        }
    }

    pub fn record_rejected_utterance(&self) {
        self.write_metrics().rejected_utterances += 1;
    }

    /// Snapshot for the metrics endpoint; the lock is released before serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversation::pipeline::tests::{
        pipeline, FakeGenerator, FakeTranscriber, GOOD_REPLY,
    };
    use crate::conversation::ConversationStore;
    use crate::reply::StructuredReply;
    use tempfile::TempDir;

    /// State backed by a scratch database and canned upstream fakes.
    pub(crate) fn test_state(config: AppConfig) -> (TempDir, AppState) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path().join("state.sqlite3")).unwrap();
        let pipeline = pipeline(
            &store,
            Arc::new(FakeTranscriber::ok("hello")),
            Arc::new(FakeGenerator::replying(GOOD_REPLY)),
            None,
        );
        (dir, AppState::new(config, Arc::new(pipeline)))
    }

    fn outcome(fallback: bool, persisted: bool) -> UtteranceOutcome {
        UtteranceOutcome {
            transcript: "hi".to_string(),
            reply: StructuredReply::fallback(),
            fallback_reason: fallback.then_some(crate::reply::ReplyError::MissingObject),
            conversation_id: None,
            persisted,
            audio: None,
        }
    }

    /// The session cap is enforced and slots are returned on release.
    #[test]
    fn test_session_slots() {
        let (_dir, state) = test_state(AppConfig::default());
        assert!(state.try_acquire_session(2));
        assert!(state.try_acquire_session(2));
        assert!(!state.try_acquire_session(2));
        assert_eq!(state.get_metrics_snapshot().active_sessions, 2);

        state.release_session();
        assert!(state.try_acquire_session(2));

        state.release_session();
        state.release_session();
        state.release_session();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_record_utterance_counters() {
        let (_dir, state) = test_state(AppConfig::default());
        state.record_utterance(&Ok(outcome(false, true)));
        state.record_utterance(&Ok(outcome(true, false)));
        state.record_utterance(&Err(PipelineError::UnknownUser));
        state.record_rejected_utterance();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.utterances_processed, 2);
        assert_eq!(metrics.fallback_replies, 1);
        assert_eq!(metrics.unpersisted_replies, 1);
        assert_eq!(metrics.pipeline_failures, 1);
        assert_eq!(metrics.rejected_utterances, 1);
    }

    /// An invalid config is refused and the old one stays live.
    #[test]
    fn test_update_config_validates() {
        let (_dir, state) = test_state(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, AppConfig::default().server.port);
    }

    #[test]
    fn test_endpoint_metric_rates() {
        let (_dir, state) = test_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let metric = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
