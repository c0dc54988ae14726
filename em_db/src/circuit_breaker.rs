//! ABOUTME: Circuit breaker guarding connection acquisition
//! ABOUTME: Opens after consecutive failures and stays open for a fixed cooldown

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed, // Acquisitions pass through
    Open,   // Acquisitions rejected until the cooldown elapses
}

impl CircuitState {
    /// Convert to metric value (0=closed, 1=open)
    pub fn to_metric_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u64,
    /// How long the circuit stays open once tripped
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker for connection acquisition
///
/// Only the cooldown closes an open circuit. A success resets the failure
/// streak but leaves an open gate shut until its deadline passes.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU64,
    is_open: AtomicBool,
    /// Guards open/close transitions
    opened_at: Mutex<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            consecutive_failures: AtomicU64::new(0),
            is_open: AtomicBool::new(false),
            opened_at: Mutex::new(None),
            config,
        }
    }

    pub fn default_config() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Get current circuit state, closing the circuit if its cooldown has elapsed
    pub fn state(&self) -> CircuitState {
        if !self.is_open.load(Ordering::Acquire) {
            return CircuitState::Closed;
        }

        let mut opened_at = self.opened_at.lock().unwrap_or_else(|e| e.into_inner());
        match *opened_at {
            Some(at) if at.elapsed() >= self.config.cooldown => {
                *opened_at = None;
                self.consecutive_failures.store(0, Ordering::Release);
                self.is_open.store(false, Ordering::Release);
                info!("Circuit breaker RESET after cooldown");
                CircuitState::Closed
            }
            // Another caller already closed it
            None => CircuitState::Closed,
            Some(_) => CircuitState::Open,
        }
    }

    /// Check if circuit is open (should reject acquisitions)
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Record a successful query
    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::AcqRel);
        if previous > 0 {
            debug!(
                previous_failures = previous,
                circuit_open = self.is_open.load(Ordering::Acquire),
                "Consecutive failure streak reset by successful query"
            );
        }
    }

    /// Record a connection failure; returns true if this failure tripped the circuit
    pub fn record_failure(&self) -> bool {
        // An expired gate closes first so this failure starts the next streak
        self.state();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if failures < self.config.failure_threshold {
            debug!(
                failures = failures,
                threshold = self.config.failure_threshold,
                "Connection failure recorded"
            );
            return false;
        }

        let mut opened_at = self.opened_at.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_open.load(Ordering::Acquire) {
            return false;
        }

        *opened_at = Some(Instant::now());
        self.is_open.store(true, Ordering::Release);

        error!(
            failures = failures,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Circuit breaker OPEN - too many connection failures"
        );
        true
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Time left before an open circuit closes, if open
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        if !self.is_open.load(Ordering::Acquire) {
            return None;
        }
        let opened_at = self.opened_at.lock().unwrap_or_else(|e| e.into_inner());
        opened_at.map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
    }
}
