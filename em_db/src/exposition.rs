//! ABOUTME: Prometheus text exposition for the connection pool
//! ABOUTME: Serializes pool stats and health into a scrape-ready payload

use std::sync::atomic::AtomicU64;

use em_core::{Error, Result};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

use crate::metrics::{round2, PoolStats, QueryMetrics};

/// Health inputs for the exposition, read without running a canary
#[derive(Debug, Clone, Copy)]
pub struct ExpositionHealth {
    pub circuit_open: bool,
    /// Percent
    pub error_rate: f64,
}

fn int_gauge(value: i64) -> Gauge {
    let gauge = Gauge::default();
    gauge.set(value);
    gauge
}

fn float_gauge(value: f64) -> Gauge<f64, AtomicU64> {
    let gauge = Gauge::<f64, AtomicU64>::default();
    gauge.set(value);
    gauge
}

fn register_counter(registry: &mut Registry, name: &str, help: &str, counter: &Counter) {
    registry.register(name, help, counter.clone());
}

/// Render stats and health as Prometheus text
///
/// A fresh registry is built for every call; counters are shared with the
/// recorder, gauges are snapshots of `stats`.
pub fn render(stats: &PoolStats, health: ExpositionHealth, metrics: &QueryMetrics) -> Result<String> {
    let mut registry = Registry::with_prefix("db_pool");

    registry.register(
        "total_connections",
        "Total number of connections in the pool",
        int_gauge(i64::from(stats.total_connections)),
    );
    registry.register(
        "active_connections",
        "Number of active connections",
        int_gauge(i64::from(stats.active_connections)),
    );
    registry.register(
        "idle_connections",
        "Number of idle connections",
        int_gauge(i64::from(stats.idle_connections)),
    );
    registry.register(
        "waiting_requests",
        "Number of waiting requests",
        int_gauge(stats.waiting_requests as i64),
    );

    register_counter(
        &mut registry,
        "queries",
        "Total number of queries executed",
        &metrics.total_queries,
    );
    register_counter(
        &mut registry,
        "errors",
        "Total number of query errors",
        &metrics.total_errors,
    );
    register_counter(
        &mut registry,
        "connection_errors",
        "Errors reported by the pool outside of queries",
        &metrics.connection_errors,
    );
    register_counter(
        &mut registry,
        "acquire_timeouts",
        "Connection acquisitions that hit the timeout",
        &metrics.acquire_timeouts,
    );
    register_counter(
        &mut registry,
        "circuit_breaker_trips",
        "Number of times the circuit breaker opened",
        &metrics.circuit_breaker_trips,
    );

    registry.register(
        "average_query_time_ms",
        "Average query execution time in milliseconds",
        float_gauge(stats.average_query_time),
    );
    registry.register(
        "uptime_seconds",
        "Pool uptime in seconds",
        int_gauge(stats.uptime as i64),
    );
    registry.register(
        "health",
        "Pool health status (1=healthy, 0=unhealthy)",
        int_gauge(if health.circuit_open { 0 } else { 1 }),
    );
    registry.register(
        "error_rate",
        "Error rate percentage",
        float_gauge(round2(health.error_rate)),
    );
    registry.register(
        "circuit_breaker_open",
        "Circuit breaker state (1=open, 0=closed)",
        int_gauge(i64::from(health.circuit_open)),
    );

    let mut buffer = String::new();
    encode(&mut buffer, &registry)
        .map_err(|e| Error::Database(format!("Failed to encode metrics: {}", e)))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> PoolStats {
        PoolStats {
            total_connections: 5,
            active_connections: 2,
            idle_connections: 3,
            waiting_requests: 1,
            total_queries: 40,
            total_errors: 2,
            average_query_time: 3.25,
            uptime: 120,
        }
    }

    #[test]
    fn test_render_contains_all_series() {
        let metrics = QueryMetrics::default();
        for _ in 0..40 {
            metrics.record_attempt();
        }
        metrics.record_error();
        metrics.record_error();

        let text = render(
            &stats(),
            ExpositionHealth {
                circuit_open: false,
                error_rate: metrics.error_rate(),
            },
            &metrics,
        )
        .expect("Should encode successfully");

        assert!(text.contains("# TYPE db_pool_total_connections gauge"));
        assert!(text.contains("db_pool_total_connections 5"));
        assert!(text.contains("db_pool_active_connections 2"));
        assert!(text.contains("db_pool_idle_connections 3"));
        assert!(text.contains("db_pool_waiting_requests 1"));
        assert!(text.contains("# TYPE db_pool_queries counter"));
        assert!(text.contains("db_pool_queries_total 40"));
        assert!(text.contains("db_pool_errors_total 2"));
        assert!(text.contains("db_pool_average_query_time_ms 3.25"));
        assert!(text.contains("db_pool_uptime_seconds 120"));
        assert!(text.contains("db_pool_health 1"));
        assert!(text.contains("db_pool_error_rate 5"));
        assert!(text.contains("db_pool_circuit_breaker_open 0"));
    }

    #[test]
    fn test_open_circuit_reports_unhealthy() {
        let text = render(
            &stats(),
            ExpositionHealth {
                circuit_open: true,
                error_rate: 0.0,
            },
            &QueryMetrics::default(),
        )
        .unwrap();

        assert!(text.contains("db_pool_health 0"));
        assert!(text.contains("db_pool_circuit_breaker_open 1"));
    }

    #[test]
    fn test_render_has_no_side_effects() {
        let metrics = QueryMetrics::default();
        metrics.record_attempt();

        let health = ExpositionHealth {
            circuit_open: false,
            error_rate: 0.0,
        };
        let first = render(&stats(), health, &metrics).unwrap();
        let second = render(&stats(), health, &metrics).unwrap();

        assert_eq!(first, second);
        assert_eq!(metrics.total_queries(), 1);
    }
}
