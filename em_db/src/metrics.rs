//! ABOUTME: Query metrics recorder for the connection pool
//! ABOUTME: Monotonic counters plus a bounded rolling window of query latencies

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use prometheus_client::metrics::counter::Counter;
use serde::{Deserialize, Serialize};

/// Round to two decimal places
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub waiting_requests: u64,
    pub total_queries: u64,
    pub total_errors: u64,
    /// Milliseconds, rounded to two decimals
    pub average_query_time: f64,
    /// Seconds since the manager was created
    pub uptime: u64,
}

/// Fixed-capacity FIFO of recent query durations in milliseconds
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, evicting the oldest once full
    pub fn push(&mut self, duration_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn oldest(&self) -> Option<f64> {
        self.samples.front().copied()
    }

    /// Mean of the window rounded to two decimals, 0 when empty
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().sum();
        round2(sum / self.samples.len() as f64)
    }
}

/// Metrics for queries issued through the pool manager
///
/// Counters are `prometheus_client` counters so the exposition renderer can
/// register them directly.
#[derive(Debug, Clone)]
pub struct QueryMetrics {
    /// Every query attempt, successful or not
    pub total_queries: Counter,
    /// Failed attempts plus failed manual acquisitions
    pub total_errors: Counter,
    /// Errors reported by the native pool outside any caller
    pub connection_errors: Counter,
    pub acquire_timeouts: Counter,
    pub slow_acquisitions: Counter,
    pub circuit_breaker_trips: Counter,
    /// Acquisitions refused while the circuit was open
    pub circuit_rejections: Counter,
    latencies: Arc<Mutex<LatencyWindow>>,
}

impl QueryMetrics {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            total_queries: Counter::default(),
            total_errors: Counter::default(),
            connection_errors: Counter::default(),
            acquire_timeouts: Counter::default(),
            slow_acquisitions: Counter::default(),
            circuit_breaker_trips: Counter::default(),
            circuit_rejections: Counter::default(),
            latencies: Arc::new(Mutex::new(LatencyWindow::new(window_capacity))),
        }
    }

    pub fn record_attempt(&self) {
        self.total_queries.inc();
    }

    pub fn record_error(&self) {
        self.total_errors.inc();
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.inc();
    }

    pub fn record_timeout(&self) {
        self.acquire_timeouts.inc();
    }

    pub fn record_slow_acquisition(&self) {
        self.slow_acquisitions.inc();
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.inc();
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.inc();
    }

    pub fn record_duration(&self, duration_ms: f64) {
        self.window().push(duration_ms);
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.get()
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.get()
    }

    /// Average latency of the current window in milliseconds
    pub fn average_query_time(&self) -> f64 {
        self.window().average()
    }

    pub fn window_len(&self) -> usize {
        self.window().len()
    }

    /// Error rate in percent (unrounded)
    pub fn error_rate(&self) -> f64 {
        let queries = self.total_queries();
        if queries == 0 {
            return 0.0;
        }
        self.total_errors() as f64 / queries as f64 * 100.0
    }

    fn window(&self) -> std::sync::MutexGuard<'_, LatencyWindow> {
        self.latencies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new(1000)
    }
}
