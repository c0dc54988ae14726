//! ABOUTME: Immutable pool configuration and TLS policy derivation
//! ABOUTME: Built once from the loaded database config, never mutated afterwards

use std::path::PathBuf;
use std::time::Duration;

use em_config::DatabaseConfig;
use em_core::{Error, Result};

use crate::circuit_breaker::CircuitBreakerConfig;

/// TLS requirement derived from the connection string's `sslmode` marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Driver default for the URL
    Disabled,
    /// Use TLS if the server offers it
    Preferred,
    /// TLS is mandatory
    Required {
        /// Reject untrusted server certificates
        verify_certificate: bool,
        /// Custom CA bundle (PEM)
        ca_certificate: Option<PathBuf>,
    },
}

impl TlsPolicy {
    /// Derive the policy from a connection string
    ///
    /// `production` decides whether a required TLS connection also verifies
    /// the server certificate.
    pub fn from_url(url: &str, production: bool, ca_certificate: Option<PathBuf>) -> Self {
        if url.contains("sslmode=require") || url.contains("sslmode=verify") {
            TlsPolicy::Required {
                verify_certificate: production,
                ca_certificate,
            }
        } else if url.contains("sslmode=prefer") || url.contains("sslmode=allow") {
            TlsPolicy::Preferred
        } else {
            TlsPolicy::Disabled
        }
    }
}

/// Configuration for the connection pool manager
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target connection string; `initialize()` fails without it
    pub database_url: Option<String>,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Idle connections above `min_connections` are closed after this long
    pub idle_timeout: Duration,
    /// Upper bound on waiting for a free connection
    pub acquire_timeout: Duration,
    /// Ping connections that sat idle longer than `keepalive_delay` before handing them out
    pub keepalive: bool,
    pub keepalive_delay: Duration,
    pub tls: TlsPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Capacity of the rolling latency window
    pub latency_window: usize,
    /// Acquisitions slower than this are logged
    pub slow_acquire_threshold: Duration,
    pub health_check_interval: Duration,
    /// Canary round-trip must stay under this to count as healthy
    pub max_canary_latency: Duration,
    /// Fraction of `max_connections` that may be active while healthy
    pub max_active_ratio: f64,
    /// Error-rate ceiling in percent
    pub max_error_rate: f64,
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            min_connections: 5,
            max_connections: 20,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            keepalive: true,
            keepalive_delay: Duration::from_secs(10),
            tls: TlsPolicy::Disabled,
            circuit_breaker: CircuitBreakerConfig::default(),
            latency_window: 1000,
            slow_acquire_threshold: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(30),
            max_canary_latency: Duration::from_millis(100),
            max_active_ratio: 0.9,
            max_error_rate: 5.0,
            drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    /// Build from the loaded database section
    pub fn from_database_config(db: &DatabaseConfig, production: bool) -> Result<Self> {
        let tls = db
            .url
            .as_deref()
            .map(|url| TlsPolicy::from_url(url, production, db.ssl_cert.clone().map(PathBuf::from)))
            .unwrap_or(TlsPolicy::Disabled);

        let config = Self {
            database_url: db.url.clone(),
            min_connections: db.min_connections,
            max_connections: db.max_connections,
            idle_timeout: db.idle_timeout(),
            acquire_timeout: db.acquire_timeout(),
            keepalive: db.keepalive,
            keepalive_delay: db.keepalive_delay(),
            tls,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Convenience constructor used by tests and tools
    pub fn for_url(url: impl Into<String>, min_connections: u32, max_connections: u32) -> Self {
        Self {
            database_url: Some(url.into()),
            min_connections,
            max_connections,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Validation(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.latency_window == 0 {
            return Err(Error::Validation(
                "latency_window must hold at least one sample".to_string(),
            ));
        }
        Ok(())
    }
}
