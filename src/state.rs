//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor: the
//! configuration, the session registry, the synthesis client and the metrics
//! counters.
//!
//! ## Thread Safety:
//! Config and metrics sit behind `Arc<RwLock<T>>`; reads clone and release
//! the lock immediately. The registry and synthesizer carry their own
//! internal sharing, so `AppState` itself is cheap to clone per worker.

use crate::config::AppConfig;
use crate::registry::SessionRegistry;
use crate::speech::SpeechSynthesizer;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    /// Live call sessions; the only structure the relay sides share.
    registry: SessionRegistry,
    /// Pooled client for the synthesis endpoint.
    synthesizer: SpeechSynthesizer,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters collected across all connections and requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// HTTP requests processed since start.
    pub request_count: u64,
    /// Failed HTTP requests since start.
    pub error_count: u64,
    /// Telephony media stream connections currently open.
    pub active_calls: u32,
    /// Subscriber connections currently attached to a call.
    pub active_subscribers: u32,
    /// Per-route statistics, keyed like "GET /health".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one route.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let synthesizer = SpeechSynthesizer::new(&config.speech, config.audio.sample_rate);
        Self {
            config: Arc::new(RwLock::new(config)),
            registry: SessionRegistry::new(),
            synthesizer,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the configuration; clones so the lock is released before
    /// the caller does anything slow.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn synthesizer(&self) -> &SpeechSynthesizer {
        &self.synthesizer
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Fold one finished request into the per-route statistics.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_calls(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_calls += 1;
    }

    pub fn decrement_active_calls(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
    }

    /// Media stream connections currently open; the capacity check reads
    /// this before accepting another call.
    pub fn active_call_count(&self) -> u32 {
        self.metrics.read().unwrap().active_calls
    }

    pub fn increment_active_subscribers(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_subscribers += 1;
    }

    pub fn decrement_active_subscribers(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_subscribers > 0 {
            metrics.active_subscribers -= 1;
        }
    }

    /// Consistent copy of the counters for the metrics endpoint.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            active_subscribers: metrics.active_subscribers,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
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

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_never_underflow() {
        let state = AppState::new(AppConfig::default());

        state.decrement_active_calls();
        state.decrement_active_subscribers();
        assert_eq!(state.active_call_count(), 0);

        state.increment_active_calls();
        state.increment_active_calls();
        state.decrement_active_calls();
        assert_eq!(state.active_call_count(), 1);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());

        state.record_endpoint_request("GET /health", 4, false);
        state.record_endpoint_request("GET /health", 6, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 5.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
