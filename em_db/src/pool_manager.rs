//! ABOUTME: Connection pool manager with circuit breaker, metrics and health monitoring
//! ABOUTME: Owns the single backend per target and coordinates init and graceful shutdown

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use chrono::{DateTime, Utc};
use em_core::{Error, MonotonicTimer, Result};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendFactory, ConnectionBackend, PoolEvent, PoolEventReceiver, SqlParam};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::PoolConfig;
use crate::exposition::{self, ExpositionHealth};
use crate::health::{HealthSignals, HealthSnapshot, HealthThresholds};
use crate::metrics::{round2, PoolStats, QueryMetrics};
use crate::postgres::PgBackend;
use crate::prewarm::prewarm;

const DEREF_RELEASED: &str = "(bug) connection already released to the pool";

/// Increments a shared counter for as long as it lives
#[derive(Debug)]
struct CountGuard(Arc<AtomicU64>);

impl CountGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection leased through the manager
///
/// Dropping the lease returns the connection to the pool; use
/// [`PoolManager::release_connection`] to do so explicitly.
pub struct PooledConnection<B: ConnectionBackend> {
    conn: Option<B::Connection>,
    backend: Arc<B>,
    _in_flight: CountGuard,
}

impl<B: ConnectionBackend> PooledConnection<B> {
    /// Run a statement on this lease; not counted in query metrics
    pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<B::Row>> {
        match self.conn.as_mut() {
            Some(conn) => self.backend.execute(conn, sql, params).await,
            None => Err(Error::Acquire(DEREF_RELEASED.to_string())),
        }
    }

    fn release(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.backend.release(conn),
            None => Ok(()),
        }
    }
}

impl<B: ConnectionBackend> Deref for PooledConnection<B> {
    type Target = B::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(DEREF_RELEASED)
    }
}

impl<B: ConnectionBackend> DerefMut for PooledConnection<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(DEREF_RELEASED)
    }
}

impl<B: ConnectionBackend> Drop for PooledConnection<B> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.backend.release(conn) {
                warn!(error = %e, "Failed to release dropped connection");
            }
        }
    }
}

/// Background tasks started by `initialize()`
struct Workers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct ManagerInner<B: ConnectionBackend> {
    config: PoolConfig,
    factory: BackendFactory<B>,
    backend: RwLock<Option<Arc<B>>>,
    initialized: AtomicBool,
    /// Serializes initialize/shutdown
    lifecycle: tokio::sync::Mutex<()>,
    breaker: Arc<CircuitBreaker>,
    metrics: QueryMetrics,
    waiting: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    started: MonotonicTimer,
    last_check: Mutex<DateTime<Utc>>,
    workers: Mutex<Option<Workers>>,
}

/// Manager for the single connection pool bound to one database target
///
/// Cheap to clone; clones share the same pool, breaker and metrics.
pub struct PoolManager<B: ConnectionBackend = PgBackend> {
    inner: Arc<ManagerInner<B>>,
}

impl<B: ConnectionBackend> Clone for PoolManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ConnectionBackend> std::fmt::Debug for PoolManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("initialized", &self.is_initialized())
            .field("circuit", &self.inner.breaker.state())
            .field("waiting", &self.inner.waiting.load(Ordering::SeqCst))
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

static GLOBAL: OnceLock<PoolManager<PgBackend>> = OnceLock::new();

impl PoolManager<PgBackend> {
    /// Manager for a PostgreSQL target
    pub fn new(config: PoolConfig) -> Self {
        Self::with_factory(config, Box::new(PgBackend::open))
    }

    /// Process-wide manager built from the loaded configuration
    pub fn global() -> Result<&'static PoolManager<PgBackend>> {
        if let Some(manager) = GLOBAL.get() {
            return Ok(manager);
        }
        let config = em_config::Config::load()?;
        let pool_config =
            PoolConfig::from_database_config(&config.database, config.is_production())?;
        Ok(Self::global_with(pool_config))
    }

    /// Process-wide manager; `config` is used only if none exists yet
    pub fn global_with(config: PoolConfig) -> &'static PoolManager<PgBackend> {
        GLOBAL.get_or_init(|| Self::new(config))
    }
}

impl<B: ConnectionBackend> PoolManager<B> {
    /// Manager whose backend is built by `factory` at `initialize()`
    pub fn with_factory(config: PoolConfig, factory: BackendFactory<B>) -> Self {
        let metrics = QueryMetrics::new(config.latency_window);
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        Self {
            inner: Arc::new(ManagerInner {
                config,
                factory,
                backend: RwLock::new(None),
                initialized: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                breaker,
                metrics,
                waiting: Arc::new(AtomicU64::new(0)),
                in_flight: Arc::new(AtomicU64::new(0)),
                started: MonotonicTimer::new(),
                last_check: Mutex::new(Utc::now()),
                workers: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.inner.metrics
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Requests currently queued for a connection
    pub fn waiting_requests(&self) -> u64 {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Leases currently held by callers
    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Build the backend, pre-warm it and start background monitoring
    ///
    /// Calling this on an initialized manager is a no-op. On failure the
    /// half-built backend is closed and the manager stays uninitialized.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_initialized() {
            info!("Connection pool already initialized");
            return Ok(());
        }

        let config = &self.inner.config;
        let url = config.database_url.as_deref().ok_or_else(|| {
            Error::Config("DATABASE_URL environment variable is required".to_string())
        })?;
        config.validate()?;

        info!(
            target_db = %em_config::redact_url(url),
            min = config.min_connections,
            max = config.max_connections,
            tls = ?config.tls,
            "Initializing connection pool"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = Arc::new((self.inner.factory)(config, events_tx)?);

        let token = CancellationToken::new();
        let pump = tokio::spawn(run_event_pump(
            events_rx,
            Arc::clone(&self.inner.breaker),
            self.inner.metrics.clone(),
            token.child_token(),
        ));

        if let Err(e) = prewarm(backend.as_ref(), config.min_connections, config.acquire_timeout).await
        {
            error!(error = %e, "Failed to initialize connection pool");
            token.cancel();
            backend.close().await;
            let _ = pump.await;
            return Err(e);
        }

        *self.inner.backend.write().await = Some(backend);
        self.inner.initialized.store(true, Ordering::SeqCst);

        let health = tokio::spawn(run_health_timer(
            Arc::downgrade(&self.inner),
            config.health_check_interval,
            token.child_token(),
        ));
        *lock(&self.inner.workers) = Some(Workers {
            token,
            handles: vec![pump, health],
        });

        info!(
            min = config.min_connections,
            max = config.max_connections,
            "Connection pool initialized"
        );
        Ok(())
    }

    /// Backend handle, or `NotInitialized`
    pub async fn get_pool(&self) -> Result<Arc<B>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        self.inner
            .backend
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Lease a connection, guarded by the circuit breaker and acquire timeout
    ///
    /// Gate rejections (uninitialized, circuit open) touch no error counter;
    /// a failed backend acquire counts one error.
    pub async fn acquire_connection(&self) -> Result<PooledConnection<B>> {
        let leased = self.lease().await;
        if let Err(e) = &leased {
            if !matches!(e, Error::NotInitialized | Error::CircuitOpen) {
                self.inner.metrics.record_error();
            }
            debug!(error = %e, "Manual connection acquisition failed");
        }
        leased
    }

    /// Return a lease; release errors are logged, never propagated
    pub fn release_connection(&self, conn: PooledConnection<B>) {
        if let Err(e) = conn.release() {
            warn!(error = %e, "Error releasing connection");
        }
    }

    /// Run a statement on a manual lease, e.g. inside a transaction
    pub async fn execute_on(
        &self,
        conn: &mut PooledConnection<B>,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<B::Row>> {
        conn.execute(sql, params).await
    }

    /// Acquire, run `f` with the lease, release
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PooledConnection<B>) -> BoxFuture<'_, Result<T>>,
    {
        let mut conn = self.acquire_connection().await?;
        let result = f(&mut conn).await;
        self.release_connection(conn);
        result
    }

    /// Run one statement with full metrics and breaker accounting
    ///
    /// Every attempt counts as a query and records its latency, acquisition
    /// included. A failed attempt counts exactly one error. No retries.
    #[instrument(level = "debug", skip(self, params), fields(params = params.len()))]
    pub async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<B::Row>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let timer = MonotonicTimer::new();
        self.inner.metrics.record_attempt();

        let result = self.run_statement(sql, params).await;
        self.inner.metrics.record_duration(timer.elapsed_ms());

        match result {
            Ok(rows) => {
                self.inner.breaker.record_success();
                Ok(rows)
            }
            Err(e) => {
                self.inner.metrics.record_error();
                error!(error = %e, "Query execution error");
                Err(e)
            }
        }
    }

    async fn run_statement(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<B::Row>> {
        let mut conn = self.lease().await?;
        let result = conn.execute(sql, params).await;
        self.release_connection(conn);
        result
    }

    async fn lease(&self) -> Result<PooledConnection<B>> {
        let backend = self.get_pool().await?;
        let config = &self.inner.config;

        if self.inner.breaker.is_open() {
            self.inner.metrics.record_circuit_rejection();
            warn!(
                remaining_secs = self
                    .inner
                    .breaker
                    .remaining_cooldown()
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                "Circuit breaker is OPEN, rejecting connection request"
            );
            return Err(Error::CircuitOpen);
        }

        let timer = MonotonicTimer::new();
        let acquired = {
            let _waiting = CountGuard::enter(&self.inner.waiting);
            tokio::time::timeout(config.acquire_timeout, backend.acquire()).await
        };

        let conn = match acquired {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                if matches!(e, Error::AcquireTimeout(_)) {
                    self.inner.metrics.record_timeout();
                }
                self.record_acquire_failure(&e);
                return Err(e);
            }
            Err(_) => {
                let e = Error::AcquireTimeout(config.acquire_timeout);
                self.inner.metrics.record_timeout();
                self.record_acquire_failure(&e);
                return Err(e);
            }
        };

        let elapsed = timer.elapsed();
        if elapsed > config.slow_acquire_threshold {
            self.inner.metrics.record_slow_acquisition();
            warn!(
                acquire_ms = elapsed.as_millis() as u64,
                threshold_ms = config.slow_acquire_threshold.as_millis() as u64,
                "Slow connection acquisition"
            );
        }

        Ok(PooledConnection {
            conn: Some(conn),
            backend,
            _in_flight: CountGuard::enter(&self.inner.in_flight),
        })
    }

    fn record_acquire_failure(&self, e: &Error) {
        error!(error = %e, "Failed to acquire connection");
        record_breaker_failure(&self.inner.breaker, &self.inner.metrics);
    }

    /// Live pool statistics
    pub async fn get_stats(&self) -> Result<PoolStats> {
        let backend = self.get_pool().await?;
        let metrics = &self.inner.metrics;

        let total = backend.size();
        let idle = (backend.num_idle() as u32).min(total);

        Ok(PoolStats {
            total_connections: total,
            active_connections: total - idle,
            idle_connections: idle,
            waiting_requests: self.waiting_requests(),
            total_queries: metrics.total_queries(),
            total_errors: metrics.total_errors(),
            average_query_time: metrics.average_query_time(),
            uptime: self.inner.started.elapsed_secs(),
        })
    }

    /// Run the canary and combine it with breaker, saturation and error-rate signals
    pub async fn health_check(&self) -> HealthSnapshot {
        let timer = MonotonicTimer::new();
        let canary = self.query("SELECT 1", &[]).await;
        let canary_latency = timer.elapsed();

        if let Err(e) = canary {
            error!(error = %e, "Health check failed");
            return HealthSnapshot::failed(*lock(&self.inner.last_check));
        }

        let now = Utc::now();
        *lock(&self.inner.last_check) = now;

        let active_connections = match self.inner.backend.read().await.as_ref() {
            Some(backend) => backend.size().saturating_sub(backend.num_idle() as u32),
            None => 0,
        };

        let signals = HealthSignals {
            circuit_open: self.inner.breaker.is_open(),
            active_connections,
            max_connections: self.inner.config.max_connections,
            error_rate: self.inner.metrics.error_rate(),
            canary_latency,
        };
        let thresholds = HealthThresholds::from(&self.inner.config);
        let healthy = signals.is_healthy(&thresholds);

        if !healthy {
            warn!(
                circuit_ok = signals.circuit_ok(),
                saturation_ok = signals.saturation_ok(&thresholds),
                error_rate_ok = signals.error_rate_ok(&thresholds),
                latency_ok = signals.latency_ok(&thresholds),
                active_connections,
                error_rate = round2(signals.error_rate),
                canary_ms = canary_latency.as_millis() as u64,
                "Connection pool unhealthy"
            );
        }

        HealthSnapshot {
            healthy,
            active_connections,
            last_check: now,
            error_rate: round2(signals.error_rate),
        }
    }

    /// Prometheus text exposition of stats and breaker health
    pub async fn prometheus_metrics(&self) -> Result<String> {
        let stats = self.get_stats().await?;
        let health = ExpositionHealth {
            circuit_open: self.inner.breaker.is_open(),
            error_rate: self.inner.metrics.error_rate(),
        };
        exposition::render(&stats, health, &self.inner.metrics)
    }

    /// Drain outstanding work, stop background tasks and close the pool
    ///
    /// Never fails; problems are logged. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let was_initialized = self.inner.initialized.swap(false, Ordering::SeqCst);
        let backend = self.inner.backend.read().await.clone();

        if !was_initialized && backend.is_none() {
            debug!("Connection pool already shut down");
            return;
        }

        info!("Shutting down connection pool");
        self.drain().await;

        let workers = lock(&self.inner.workers).take();
        if let Some(workers) = workers {
            workers.token.cancel();
            for handle in workers.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background pool task ended abnormally");
                }
            }
        }

        if let Some(backend) = self.inner.backend.write().await.take() {
            let drain_timeout = self.inner.config.drain_timeout;
            if tokio::time::timeout(drain_timeout, backend.close()).await.is_err() {
                warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "Timed out closing connection pool"
                );
            }
        }

        info!("Connection pool shut down");
    }

    async fn drain(&self) {
        let config = &self.inner.config;
        let outstanding = || self.waiting_requests() > 0 || self.in_flight() > 0;

        let wait = async {
            while outstanding() {
                tokio::time::sleep(config.drain_poll_interval).await;
            }
        };

        if tokio::time::timeout(config.drain_timeout, wait).await.is_err() {
            warn!(
                waiting = self.waiting_requests(),
                in_flight = self.in_flight(),
                "Drain timed out, closing pool with outstanding work"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn record_breaker_failure(breaker: &CircuitBreaker, metrics: &QueryMetrics) {
    if breaker.record_failure() {
        metrics.record_circuit_breaker_trip();
    }
}

async fn run_event_pump(
    mut events: PoolEventReceiver,
    breaker: Arc<CircuitBreaker>,
    metrics: QueryMetrics,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(PoolEvent::Connected) => debug!("New database connection established"),
            Some(PoolEvent::Removed) => debug!("Database connection removed from pool"),
            Some(PoolEvent::Error(message)) => {
                error!(error = %message, "Unexpected database pool error");
                metrics.record_connection_error();
                record_breaker_failure(&breaker, &metrics);
            }
            None => break,
        }
    }
    debug!("Pool event pump stopped");
}

async fn run_health_timer<B: ConnectionBackend>(
    inner: Weak<ManagerInner<B>>,
    period: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let manager = PoolManager { inner };
                let snapshot = tokio::select! {
                    _ = token.cancelled() => break,
                    snapshot = manager.health_check() => snapshot,
                };
                debug!(
                    healthy = snapshot.healthy,
                    active = snapshot.active_connections,
                    error_rate = snapshot.error_rate,
                    "Periodic health check"
                );
            }
        }
    }
    debug!("Health timer stopped");
}
