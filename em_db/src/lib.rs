//! ABOUTME: Database layer owning the PostgreSQL connection pool
//! ABOUTME: Pool lifecycle, circuit breaker, query metrics, health and exposition

pub mod backend;
pub mod circuit_breaker;
pub mod config;
pub mod exposition;
pub mod health;
pub mod metrics;
pub mod pool_manager;
pub mod postgres;
pub mod prewarm;
pub mod stub;

pub use backend::{
    BackendFactory, ConnectionBackend, HasSqlType, PoolEvent, PoolEventSender, SqlParam, SqlType,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{PoolConfig, TlsPolicy};
pub use exposition::ExpositionHealth;
pub use health::{HealthSignals, HealthSnapshot, HealthThresholds};
pub use metrics::{LatencyWindow, PoolStats, QueryMetrics};
pub use pool_manager::{PoolManager, PooledConnection};
pub use postgres::PgBackend;
pub use stub::{StubBackend, StubConnection};
