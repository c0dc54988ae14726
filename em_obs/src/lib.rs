//! ABOUTME: Monitoring HTTP surface for the connection pool
//! ABOUTME: Liveness, readiness, pool stats/health/dashboard and Prometheus scrape endpoints

use actix_web::{
    dev::{Server, ServiceRequest, ServiceResponse},
    middleware::Logger,
    web, App, HttpResponse, HttpServer, Result as ActixResult,
};
use em_core::{now_rfc3339, MonotonicTimer, Result};
use em_db::{ConnectionBackend, PgBackend, PoolManager};
use serde_json::json;
use std::net::TcpListener;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Readiness gate toggled by the lifecycle: set after init, cleared at shutdown
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    ready: Arc<AtomicBool>,
}

impl ReadinessGate {
    /// Starts not ready
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state for monitoring endpoints
pub struct ObsState<B: ConnectionBackend = PgBackend> {
    pub readiness: ReadinessGate,
    pub pool: PoolManager<B>,
    started: MonotonicTimer,
}

impl<B: ConnectionBackend> Clone for ObsState<B> {
    fn clone(&self) -> Self {
        Self {
            readiness: self.readiness.clone(),
            pool: self.pool.clone(),
            started: self.started,
        }
    }
}

impl<B: ConnectionBackend> ObsState<B> {
    pub fn new(pool: PoolManager<B>) -> Self {
        Self {
            readiness: ReadinessGate::new(),
            pool,
            started: MonotonicTimer::new(),
        }
    }

    /// Seconds since the monitoring surface was created
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed_secs()
    }
}

fn failure(message: &str, error: &em_core::Error) -> serde_json::Value {
    json!({
        "success": false,
        "message": message,
        "error": error.to_string(),
    })
}

async fn health() -> ActixResult<HttpResponse> {
    tracing::debug!("Liveness check requested");
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok"
    })))
}

async fn readiness<B: ConnectionBackend>(state: web::Data<ObsState<B>>) -> ActixResult<HttpResponse> {
    let is_ready = state.readiness.is_ready();
    tracing::debug!(ready = is_ready, "Readiness check requested");

    if is_ready {
        Ok(HttpResponse::Ok().json(json!({
            "status": "ready"
        })))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(json!({
            "status": "not ready"
        })))
    }
}

/// GET /api/monitoring/pool/stats
async fn pool_stats<B: ConnectionBackend>(state: web::Data<ObsState<B>>) -> ActixResult<HttpResponse> {
    match state.pool.get_stats().await {
        Ok(stats) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "stats": stats,
            "timestamp": now_rfc3339(),
        }))),
        Err(e) => {
            tracing::error!(error = %e, "Error getting pool stats");
            Ok(HttpResponse::InternalServerError()
                .json(failure("Failed to retrieve pool statistics", &e)))
        }
    }
}

/// GET /api/monitoring/pool/health; 503 when unhealthy
async fn pool_health<B: ConnectionBackend>(state: web::Data<ObsState<B>>) -> ActixResult<HttpResponse> {
    let health = state.pool.health_check().await;
    let body = json!({
        "success": true,
        "health": health,
        "timestamp": now_rfc3339(),
    });

    if health.healthy {
        Ok(HttpResponse::Ok().json(body))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(body))
    }
}

/// GET /api/monitoring/dashboard
async fn dashboard<B: ConnectionBackend>(state: web::Data<ObsState<B>>) -> ActixResult<HttpResponse> {
    let stats = match state.pool.get_stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "Error getting dashboard data");
            return Ok(HttpResponse::InternalServerError()
                .json(failure("Failed to retrieve dashboard data", &e)));
        }
    };
    let health = state.pool.health_check().await;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "dashboard": {
            "stats": stats,
            "health": health,
            "system": {
                "uptime": state.uptime_secs(),
            },
        },
        "timestamp": now_rfc3339(),
    })))
}

/// GET /api/database/status
async fn database_status<B: ConnectionBackend>(
    state: web::Data<ObsState<B>>,
) -> ActixResult<HttpResponse> {
    let health = state.pool.health_check().await;

    Ok(HttpResponse::Ok().json(json!({
        "settingdbOnline": health.healthy,
        "usingFallback": false,
        "activeDatabase": "PostgreSQL Connection Pool",
        "poolStatus": {
            "healthy": health.healthy,
            "activeConnections": health.active_connections,
            "errorRate": health.error_rate,
        },
        "timestamp": now_rfc3339(),
    })))
}

/// GET /metrics
async fn metrics<B: ConnectionBackend>(state: web::Data<ObsState<B>>) -> ActixResult<HttpResponse> {
    tracing::debug!("Metrics scrape requested");

    match state.pool.prometheus_metrics().await {
        Ok(metrics_text) => {
            tracing::debug!(bytes = metrics_text.len(), "Metrics encoded");
            Ok(HttpResponse::Ok()
                .content_type(PROMETHEUS_CONTENT_TYPE)
                .body(metrics_text))
        }
        Err(e) if e.is_unavailable() => {
            tracing::warn!(error = %e, "Metrics unavailable");
            Ok(HttpResponse::ServiceUnavailable().json(json!({
                "error": e.to_string()
            })))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to encode metrics"
            })))
        }
    }
}

/// Create monitoring service factory
pub fn create_service<B: ConnectionBackend>(
    state: ObsState<B>,
) -> App<
    impl actix_web::dev::ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(web::Data::new(state))
        .wrap(Logger::default())
        .service(
            web::scope("")
                .route("/healthz", web::get().to(health))
                .route("/readyz", web::get().to(readiness::<B>))
                .route("/metrics", web::get().to(metrics::<B>))
                .route("/api/monitoring/pool/stats", web::get().to(pool_stats::<B>))
                .route("/api/monitoring/pool/health", web::get().to(pool_health::<B>))
                .route("/api/monitoring/dashboard", web::get().to(dashboard::<B>))
                .route("/api/database/status", web::get().to(database_status::<B>)),
        )
}

/// Build the monitoring server on a bound listener without running it
///
/// Signal handling is left to the caller, which stops the server through
/// its handle after draining the pool.
pub fn serve<B: ConnectionBackend>(listener: TcpListener, state: ObsState<B>) -> Result<Server> {
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "Starting monitoring server");

    let server = HttpServer::new(move || create_service(state.clone()))
        .disable_signals()
        .listen(listener)
        .map_err(|e| em_core::Error::Config(format!("Failed to bind server: {}", e)))?
        .run();

    Ok(server)
}

/// Start monitoring server; resolves when the server stops
pub async fn start_server<B: ConnectionBackend>(bind_addr: &str, state: ObsState<B>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .map_err(|e| em_core::Error::Config(format!("Failed to bind {}: {}", bind_addr, e)))?;

    serve(listener, state)?
        .await
        .map_err(|e| em_core::Error::Config(format!("Server error: {}", e)))?;

    Ok(())
}
