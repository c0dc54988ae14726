//! ABOUTME: Behavioural tests for the pool manager against the stub backend
//! ABOUTME: Covers sizing, pre-warm, circuit breaker, metrics, health and shutdown

use std::time::Duration;

use em_core::Error;
use em_db::{ConnectionBackend, PoolConfig, PoolManager, StubBackend};
use futures_util::future::join_all;
use test_support::TEST_DATABASE_URL;

fn stub_manager(min: u32, max: u32) -> (PoolManager<StubBackend>, StubBackend) {
    stub_manager_with(PoolConfig {
        health_check_interval: Duration::from_secs(3600),
        ..PoolConfig::for_url(TEST_DATABASE_URL, min, max)
    })
}

fn stub_manager_with(config: PoolConfig) -> (PoolManager<StubBackend>, StubBackend) {
    let stub = StubBackend::new();
    let manager = PoolManager::with_factory(config, stub.factory());
    (manager, stub)
}

#[tokio::test(start_paused = true)]
async fn round_trip_with_concurrent_queries() {
    let (manager, stub) = stub_manager(2, 5);
    manager.initialize().await.unwrap();
    stub.set_query_delay(Duration::from_millis(10));

    let queries = (0..5).map(|_| manager.query("SELECT 1", &[]));
    let results = join_all(queries).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let stats = manager.get_stats().await.unwrap();
    assert_eq!(stats.total_queries, 5);
    assert_eq!(stats.total_errors, 0);
    assert!(stub.peak_leased() <= 5);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.idle_connections, stats.total_connections);
    assert!(stats.total_connections <= 5);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_max_connections() {
    let (manager, stub) = stub_manager(0, 3);
    manager.initialize().await.unwrap();
    stub.set_query_delay(Duration::from_millis(50));

    let queries = (0..10i32).map(|i| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.query("SELECT $1", &[i.into()]).await })
    });
    for result in join_all(queries).await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(stub.peak_leased(), 3);
    assert!(stub.connects() <= 3);
    assert!(manager.get_stats().await.unwrap().total_connections <= 3);
    assert_eq!(manager.waiting_requests(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn prewarm_establishes_min_connections() {
    let (manager, stub) = stub_manager(4, 10);
    manager.initialize().await.unwrap();

    assert_eq!(stub.connects(), 4);
    let stats = manager.get_stats().await.unwrap();
    assert_eq!(stats.total_connections, 4);
    assert_eq!(stats.idle_connections, 4);
    assert_eq!(stats.active_connections, 0);
    // Pre-warm traffic is not query traffic
    assert_eq!(stats.total_queries, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_after_prewarm_reuses_warm_connections() {
    let (manager, stub) = stub_manager(3, 10);
    manager.initialize().await.unwrap();
    assert_eq!(stub.connects(), 3);
    stub.set_query_delay(Duration::from_millis(20));

    let burst = (0..3).map(|_| manager.query("SELECT 1", &[]));
    let results = join_all(burst).await;
    assert!(results.iter().all(|r| r.is_ok()));

    assert_eq!(stub.peak_leased(), 3);
    assert_eq!(stub.connects(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let (manager, stub) = stub_manager(2, 5);

    let (first, second) = tokio::join!(manager.initialize(), manager.initialize());
    first.unwrap();
    second.unwrap();
    manager.initialize().await.unwrap();

    assert_eq!(stub.connects(), 2);
    assert_eq!(stub.executions(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn initialize_requires_database_url() {
    let (manager, stub) = stub_manager_with(PoolConfig::default());

    let err = manager.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("DATABASE_URL"));
    assert!(!manager.is_initialized());
    assert_eq!(stub.acquire_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_after_five_failures_and_closes_after_cooldown() {
    let (manager, stub) = stub_manager(0, 5);
    manager.initialize().await.unwrap();
    stub.set_fail_acquire(true);

    for _ in 0..5 {
        let err = manager.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Acquire(_)));
    }
    assert!(manager.circuit_breaker().is_open());
    assert_eq!(stub.acquire_attempts(), 5);

    // Rejected without touching the backend
    let err = manager.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen));
    assert!(err.is_unavailable());
    assert_eq!(stub.acquire_attempts(), 5);

    stub.set_fail_acquire(false);
    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(matches!(
        manager.query("SELECT 1", &[]).await,
        Err(Error::CircuitOpen)
    ));
    assert_eq!(stub.acquire_attempts(), 5);

    tokio::time::advance(Duration::from_secs(1)).await;
    manager.query("SELECT 1", &[]).await.unwrap();
    assert!(!manager.circuit_breaker().is_open());
    assert_eq!(stub.acquire_attempts(), 6);

    let metrics = manager.metrics();
    assert_eq!(metrics.total_queries(), 8);
    assert_eq!(metrics.total_errors(), 7);
    assert_eq!(metrics.circuit_breaker_trips.get(), 1);
    assert_eq!(metrics.circuit_rejections.get(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn success_resets_failure_streak() {
    let (manager, stub) = stub_manager(0, 5);
    manager.initialize().await.unwrap();

    stub.set_fail_acquire(true);
    for _ in 0..4 {
        assert!(manager.query("SELECT 1", &[]).await.is_err());
    }
    stub.set_fail_acquire(false);
    manager.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(manager.circuit_breaker().failure_count(), 0);

    stub.set_fail_acquire(true);
    for _ in 0..4 {
        assert!(manager.query("SELECT 1", &[]).await.is_err());
    }
    assert!(!manager.circuit_breaker().is_open());

    stub.set_fail_acquire(false);
    manager.shutdown().await;
}

#[tokio::test]
async fn query_failures_do_not_trip_the_breaker() {
    let (manager, stub) = stub_manager(0, 5);
    manager.initialize().await.unwrap();
    stub.set_fail_query(true);

    for _ in 0..10 {
        let err = manager.query("SELECT broken", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    assert!(!manager.circuit_breaker().is_open());
    assert_eq!(manager.metrics().total_errors(), 10);
    assert_eq!(manager.in_flight(), 0);
    assert_eq!(stub.leased(), 0);

    stub.set_fail_query(false);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pool_error_events_trip_the_breaker() {
    let (manager, stub) = stub_manager(0, 5);
    manager.initialize().await.unwrap();

    for _ in 0..5 {
        stub.emit_error("terminating connection due to administrator command");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(manager.circuit_breaker().is_open());
    assert_eq!(manager.metrics().connection_errors.get(), 5);
    assert_eq!(manager.metrics().total_errors(), 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_when_pool_is_exhausted() {
    let (manager, _stub) = stub_manager(0, 1);
    manager.initialize().await.unwrap();

    let held = manager.acquire_connection().await.unwrap();
    let err = manager.query("SELECT 1", &[]).await.unwrap_err();

    assert!(matches!(err, Error::AcquireTimeout(d) if d == Duration::from_secs(5)));
    assert_eq!(manager.metrics().acquire_timeouts.get(), 1);
    assert_eq!(manager.waiting_requests(), 0);
    assert_eq!(manager.circuit_breaker().failure_count(), 1);

    manager.release_connection(held);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_acquisitions_are_counted() {
    let (manager, stub) = stub_manager(0, 2);
    manager.initialize().await.unwrap();
    stub.set_acquire_delay(Duration::from_millis(150));

    manager.query("SELECT 1", &[]).await.unwrap();

    assert_eq!(manager.metrics().slow_acquisitions.get(), 1);
    stub.set_acquire_delay(Duration::ZERO);
    manager.shutdown().await;
}

#[tokio::test]
async fn manual_acquire_failures_count_as_errors() {
    let (manager, stub) = stub_manager(0, 2);
    manager.initialize().await.unwrap();
    stub.set_fail_acquire(true);

    assert!(manager.acquire_connection().await.is_err());

    assert_eq!(manager.metrics().total_errors(), 1);
    assert_eq!(manager.metrics().total_queries(), 0);
    assert_eq!(manager.circuit_breaker().failure_count(), 1);

    stub.set_fail_acquire(false);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn gate_rejections_do_not_count_as_errors() {
    let (manager, stub) = stub_manager(0, 2);

    assert!(matches!(
        manager.acquire_connection().await,
        Err(Error::NotInitialized)
    ));
    assert_eq!(manager.metrics().total_errors(), 0);

    manager.initialize().await.unwrap();
    for _ in 0..5 {
        stub.emit_error("connection reset by peer");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.circuit_breaker().is_open());

    for _ in 0..3 {
        assert!(matches!(
            manager.acquire_connection().await,
            Err(Error::CircuitOpen)
        ));
    }

    assert_eq!(manager.metrics().total_errors(), 0);
    assert_eq!(manager.metrics().total_queries(), 0);
    assert_eq!(manager.metrics().circuit_rejections.get(), 3);
    assert_eq!(stub.acquire_attempts(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn counters_are_monotonic() {
    let (manager, stub) = stub_manager(0, 2);
    manager.initialize().await.unwrap();

    let mut previous = manager.get_stats().await.unwrap();
    for i in 0..20 {
        stub.set_fail_query(i % 3 == 0);
        let _ = manager.query("SELECT 1", &[]).await;

        let stats = manager.get_stats().await.unwrap();
        assert!(stats.total_queries >= previous.total_queries);
        assert!(stats.total_errors >= previous.total_errors);
        assert!(stats.total_errors <= stats.total_queries);
        previous = stats;
    }

    assert_eq!(previous.total_queries, 20);
    assert_eq!(previous.total_errors, 7);

    stub.set_fail_query(false);
    manager.shutdown().await;
}

#[tokio::test]
async fn latency_window_is_bounded() {
    let (manager, _stub) = stub_manager(0, 2);
    manager.initialize().await.unwrap();

    for _ in 0..1005 {
        manager.query("SELECT 1", &[]).await.unwrap();
    }

    assert_eq!(manager.metrics().window_len(), 1000);
    assert_eq!(manager.metrics().total_queries(), 1005);

    manager.shutdown().await;
}

#[tokio::test]
async fn health_check_reports_healthy_pool() {
    let (manager, _stub) = stub_manager(1, 5);
    manager.initialize().await.unwrap();

    let snapshot = manager.health_check().await;

    assert!(snapshot.healthy);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.error_rate, 0.0);

    manager.shutdown().await;
}

#[tokio::test]
async fn health_check_flags_saturated_pool() {
    let (manager, _stub) = stub_manager(0, 20);
    manager.initialize().await.unwrap();

    let mut held = Vec::new();
    for _ in 0..19 {
        held.push(manager.acquire_connection().await.unwrap());
    }

    let snapshot = manager.health_check().await;
    assert!(!snapshot.healthy);
    assert_eq!(snapshot.active_connections, 19);

    held.pop();
    let snapshot = manager.health_check().await;
    assert!(snapshot.healthy);
    assert_eq!(snapshot.active_connections, 18);

    for conn in held {
        manager.release_connection(conn);
    }
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn health_check_fails_when_canary_fails() {
    let (manager, stub) = stub_manager(0, 5);
    manager.initialize().await.unwrap();

    let good = manager.health_check().await;
    assert!(good.healthy);

    stub.set_fail_query(true);
    let failed = manager.health_check().await;

    assert!(!failed.healthy);
    assert_eq!(failed.active_connections, 0);
    assert_eq!(failed.error_rate, 100.0);
    assert_eq!(failed.last_check, good.last_check);

    stub.set_fail_query(false);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn health_timer_runs_periodically() {
    let (manager, stub) = stub_manager_with(PoolConfig::for_url(TEST_DATABASE_URL, 0, 5));
    manager.initialize().await.unwrap();
    assert_eq!(stub.executions(), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(stub.executions(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(stub.executions(), 2);

    manager.shutdown().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(stub.executions(), 2);
}

#[tokio::test]
async fn prometheus_metrics_reflect_traffic() {
    let (manager, _stub) = stub_manager(1, 5);
    manager.initialize().await.unwrap();

    for _ in 0..3 {
        manager.query("SELECT 1", &[]).await.unwrap();
    }
    let text = manager.prometheus_metrics().await.unwrap();

    assert!(text.contains("db_pool_queries_total 3"));
    assert!(text.contains("db_pool_errors_total 0"));
    assert!(text.contains("db_pool_total_connections 1"));
    assert!(text.contains("db_pool_health 1"));
    assert!(text.contains("db_pool_circuit_breaker_open 0"));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_waiting_requests() {
    let (manager, stub) = stub_manager(0, 1);
    manager.initialize().await.unwrap();

    let held = manager.acquire_connection().await.unwrap();
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.query("SELECT 1", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.waiting_requests(), 1);

    let shutdown = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.shutdown().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!shutdown.is_finished());
    assert!(!stub.is_closed());

    manager.release_connection(held);
    assert!(waiter.await.unwrap().is_ok());
    shutdown.await.unwrap();

    assert!(stub.is_closed());
    assert!(matches!(manager.get_pool().await, Err(Error::NotInitialized)));
    assert!(matches!(
        manager.query("SELECT 1", &[]).await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_after_drain_timeout() {
    let (manager, stub) = stub_manager(0, 1);
    manager.initialize().await.unwrap();

    let held = manager.acquire_connection().await.unwrap();
    let started = tokio::time::Instant::now();
    manager.shutdown().await;

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(stub.is_closed());
    drop(held);
    assert_eq!(stub.size(), 0);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (manager, stub) = stub_manager(1, 2);

    manager.shutdown().await;
    manager.initialize().await.unwrap();
    manager.shutdown().await;
    manager.shutdown().await;

    assert!(stub.is_closed());
    assert!(!manager.is_initialized());
}
