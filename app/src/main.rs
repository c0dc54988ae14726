use em_config::Config;
use em_core::telemetry;
use em_db::{PgBackend, PoolConfig, PoolManager};
use em_obs::ObsState;
use std::net::TcpListener;
use std::process;

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

#[tokio::main]
async fn main() {
    let environment =
        std::env::var("ENMON_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    telemetry::init_tracing(&environment, "enmon");
    tracing::info!("enmon starting");

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    tracing::info!(
        environment = %config.environment,
        host = %config.server.host,
        port = %config.server.port,
        database = %config.database.redacted_url().unwrap_or_default(),
        "Application configured"
    );

    let pool_config =
        match PoolConfig::from_database_config(&config.database, config.is_production()) {
            Ok(pool_config) => pool_config,
            Err(e) => {
                tracing::error!("Invalid pool configuration: {}", e);
                process::exit(1);
            }
        };
    let pool = PoolManager::<PgBackend>::global_with(pool_config).clone();

    if let Err(e) = pool.initialize().await {
        tracing::error!("Failed to initialize connection pool: {}", e);
        process::exit(1);
    }

    let obs_state = ObsState::new(pool.clone());
    obs_state.readiness.set_ready(true);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let server = match TcpListener::bind(&bind_addr)
        .map_err(em_core::Error::from)
        .and_then(|listener| em_obs::serve(listener, obs_state.clone()))
    {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start monitoring server on {}: {}", bind_addr, e);
            pool.shutdown().await;
            process::exit(1);
        }
    };
    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);

    let exit_code = tokio::select! {
        signal = shutdown_signal() => {
            tracing::info!(signal, "Shutdown signal received, draining connection pool");
            0
        }
        result = &mut server_task => {
            tracing::error!(?result, "Monitoring server exited unexpectedly");
            1
        }
    };

    obs_state.readiness.set_ready(false);
    pool.shutdown().await;
    server_handle.stop(true).await;

    tracing::info!("enmon stopped");
    process::exit(exit_code);
}
