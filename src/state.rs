//! # Application State Management
//!
//! Shared state handed to every HTTP request handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - The effective configuration (read-only after startup)
//! - Request metrics, updated by the metrics middleware on every request
//! - The [`Orchestrator`], which owns the engine handle, the conversation history
//!   and the event channel
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers (on many worker threads) hold the same state
//! - **RwLock**: many concurrent readers or one writer
//! - Cloning `AppState` only bumps reference counts; every clone sees the same data
//!
//! ### Poisoned locks
//! A lock becomes "poisoned" if a thread panics while holding it. Metrics are plain
//! counters, so a poisoned lock is simply recovered with `PoisonError::into_inner`
//! instead of taking the whole server down.

use crate::config::AppConfig;
use crate::relay::orchestrator::Orchestrator;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration as loaded and validated at startup
    pub config: Arc<AppConfig>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Entry point for uploads, resets and the event stream
    pub orchestrator: Orchestrator,
}

/// Performance metrics collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Total 4xx/5xx responses (for reliability monitoring)
/// - **endpoint_metrics**: Per-endpoint statistics (for performance optimization)
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: endpoint name (e.g., "POST /upload-audio")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState around a configured orchestrator.
    pub fn new(config: AppConfig, orchestrator: Orchestrator) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            orchestrator,
        }
    }

    /// Get a copy of the configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.as_ref().clone()
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called for every 4xx/5xx response).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## HashMap operations:
    /// The first time we see an endpoint, `.entry().or_default()` creates a zeroed
    /// EndpointMetric. Subsequent requests update it in place.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics.
    ///
    /// Cloning releases the lock before the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error Rate = Number of Errors ÷ Total Requests (0.0 to 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
