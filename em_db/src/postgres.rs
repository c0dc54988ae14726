//! ABOUTME: PostgreSQL backend built on the sqlx connection pool
//! ABOUTME: Maps pool configuration, TLS policy and keepalive onto PgPoolOptions

use std::str::FromStr;

use async_trait::async_trait;
use em_core::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Connection, Postgres};
use std::time::Duration;
use tracing::debug;

use crate::backend::{ConnectionBackend, PoolEvent, PoolEventSender, SqlParam, SqlType};
use crate::config::{PoolConfig, TlsPolicy};

/// sqlx-backed pool bound to one PostgreSQL target
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
    acquire_timeout: Duration,
}

impl PgBackend {
    /// Build the pool lazily; no connection is opened until first acquire
    pub fn open(config: &PoolConfig, events: PoolEventSender) -> Result<Self> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            Error::Config("DATABASE_URL environment variable is required".to_string())
        })?;

        let options = PgConnectOptions::from_str(url)
            .map_err(|e| Error::Config(format!("Invalid database URL: {}", e)))?;
        let options = apply_tls(options, &config.tls);

        let keepalive = config.keepalive.then_some(config.keepalive_delay);
        let connect_events = events.clone();
        let acquire_events = events;

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .test_before_acquire(false)
            .after_connect(move |_conn, _meta| {
                let events = connect_events.clone();
                Box::pin(async move {
                    let _ = events.send(PoolEvent::Connected);
                    Ok::<(), sqlx::Error>(())
                })
            })
            .before_acquire(move |conn, meta| {
                let events = acquire_events.clone();
                Box::pin(async move {
                    let stale = keepalive.map_or(false, |delay| meta.idle_for >= delay);
                    if !stale {
                        return Ok::<bool, sqlx::Error>(true);
                    }
                    match conn.ping().await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            // Returning false closes this connection; the pool opens another
                            let _ = events.send(PoolEvent::Error(e.to_string()));
                            let _ = events.send(PoolEvent::Removed);
                            Ok(false)
                        }
                    }
                })
            })
            .connect_lazy_with(options);

        debug!(
            min = config.min_connections,
            max = config.max_connections,
            "PostgreSQL pool created"
        );

        Ok(Self {
            pool,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// Native pool handle for the data-access layer
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn apply_tls(options: PgConnectOptions, tls: &TlsPolicy) -> PgConnectOptions {
    match tls {
        TlsPolicy::Disabled => options,
        TlsPolicy::Preferred => options.ssl_mode(PgSslMode::Prefer),
        TlsPolicy::Required {
            verify_certificate,
            ca_certificate,
        } => {
            let mode = if *verify_certificate {
                PgSslMode::VerifyFull
            } else {
                PgSslMode::Require
            };
            let options = options.ssl_mode(mode);
            match ca_certificate {
                Some(path) => options.ssl_root_cert(path),
                None => options,
            }
        }
    }
}

fn acquire_error(err: sqlx::Error, acquire_timeout: Duration) -> Error {
    match err {
        sqlx::Error::PoolTimedOut => Error::AcquireTimeout(acquire_timeout),
        other => Error::Acquire(other.to_string()),
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::TypedNull(ty) => match ty {
            SqlType::Bool => query.bind(None::<bool>),
            SqlType::Int => query.bind(None::<i32>),
            SqlType::BigInt => query.bind(None::<i64>),
            SqlType::Float => query.bind(None::<f64>),
            SqlType::Text => query.bind(None::<String>),
            SqlType::Json => query.bind(None::<sqlx::types::Json<serde_json::Value>>),
            SqlType::Timestamp => query.bind(None::<chrono::DateTime<chrono::Utc>>),
        },
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::BigInt(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
        SqlParam::Json(v) => query.bind(sqlx::types::Json(v.clone())),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

#[async_trait]
impl ConnectionBackend for PgBackend {
    type Connection = PoolConnection<Postgres>;
    type Row = PgRow;

    async fn acquire(&self) -> Result<Self::Connection> {
        self.pool
            .acquire()
            .await
            .map_err(|e| acquire_error(e, self.acquire_timeout))
    }

    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Self::Row>> {
        let query = params.iter().fold(sqlx::query(sql), bind_param);
        query
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }

    fn release(&self, conn: Self::Connection) -> Result<()> {
        // Dropping a PoolConnection returns it to the pool
        drop(conn);
        Ok(())
    }

    fn size(&self) -> u32 {
        self.pool.size()
    }

    fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
