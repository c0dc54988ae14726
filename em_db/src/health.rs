//! ABOUTME: Health verdict for the connection pool
//! ABOUTME: Combines breaker state, saturation, error rate and canary latency

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub active_connections: u32,
    /// Time of the last successful canary
    pub last_check: DateTime<Utc>,
    /// Percent, rounded to two decimals
    pub error_rate: f64,
}

impl HealthSnapshot {
    /// Snapshot returned when the canary itself fails
    pub fn failed(last_check: DateTime<Utc>) -> Self {
        Self {
            healthy: false,
            active_connections: 0,
            last_check,
            error_rate: 100.0,
        }
    }
}

/// Raw inputs to the health verdict
#[derive(Debug, Clone, Copy)]
pub struct HealthSignals {
    pub circuit_open: bool,
    pub active_connections: u32,
    pub max_connections: u32,
    /// Percent
    pub error_rate: f64,
    pub canary_latency: Duration,
}

/// Thresholds a healthy pool must stay within
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub max_active_ratio: f64,
    pub max_error_rate: f64,
    pub max_canary_latency: Duration,
}

impl From<&PoolConfig> for HealthThresholds {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_active_ratio: config.max_active_ratio,
            max_error_rate: config.max_error_rate,
            max_canary_latency: config.max_canary_latency,
        }
    }
}

impl HealthSignals {
    pub fn circuit_ok(&self) -> bool {
        !self.circuit_open
    }

    /// Active connections within the reserved headroom
    pub fn saturation_ok(&self, thresholds: &HealthThresholds) -> bool {
        f64::from(self.active_connections)
            <= thresholds.max_active_ratio * f64::from(self.max_connections)
    }

    pub fn error_rate_ok(&self, thresholds: &HealthThresholds) -> bool {
        self.error_rate < thresholds.max_error_rate
    }

    pub fn latency_ok(&self, thresholds: &HealthThresholds) -> bool {
        self.canary_latency < thresholds.max_canary_latency
    }

    /// Healthy only if every signal passes
    pub fn is_healthy(&self, thresholds: &HealthThresholds) -> bool {
        self.circuit_ok()
            && self.saturation_ok(thresholds)
            && self.error_rate_ok(thresholds)
            && self.latency_ok(thresholds)
    }
}
