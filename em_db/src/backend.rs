//! ABOUTME: Backend abstraction the pool manager drives
//! ABOUTME: Defines query parameters, pool events, and the native-pool trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use em_core::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::PoolConfig;

/// Column type of a NULL parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Bool,
    Int,
    BigInt,
    Float,
    Text,
    Json,
    Timestamp,
}

/// Rust types with a fixed parameter type, so `None` binds a matching NULL
pub trait HasSqlType {
    const SQL_TYPE: SqlType;
}

impl HasSqlType for bool {
    const SQL_TYPE: SqlType = SqlType::Bool;
}

impl HasSqlType for i32 {
    const SQL_TYPE: SqlType = SqlType::Int;
}

impl HasSqlType for i64 {
    const SQL_TYPE: SqlType = SqlType::BigInt;
}

impl HasSqlType for f64 {
    const SQL_TYPE: SqlType = SqlType::Float;
}

impl HasSqlType for &str {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl HasSqlType for String {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl HasSqlType for serde_json::Value {
    const SQL_TYPE: SqlType = SqlType::Json;
}

impl HasSqlType for DateTime<Utc> {
    const SQL_TYPE: SqlType = SqlType::Timestamp;
}

/// Positional query parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlParam {
    /// Bound as a text-typed NULL; use `TypedNull` for other column types
    Null,
    TypedNull(SqlType),
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Int(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::BigInt(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<serde_json::Value> for SqlParam {
    fn from(value: serde_json::Value) -> Self {
        SqlParam::Json(value)
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(value: DateTime<Utc>) -> Self {
        SqlParam::Timestamp(value)
    }
}

impl<T: Into<SqlParam> + HasSqlType> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value
            .map(Into::into)
            .unwrap_or(SqlParam::TypedNull(T::SQL_TYPE))
    }
}

/// Lifecycle notifications raised by the native pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new physical connection was established
    Connected,
    /// A physical connection was dropped from the pool
    Removed,
    /// The pool hit an error outside of any caller's acquisition
    Error(String),
}

pub type PoolEventSender = mpsc::UnboundedSender<PoolEvent>;
pub type PoolEventReceiver = mpsc::UnboundedReceiver<PoolEvent>;

/// Builds a backend bound to one target; called once per `initialize()`
pub type BackendFactory<B> =
    Box<dyn Fn(&PoolConfig, PoolEventSender) -> Result<B> + Send + Sync + 'static>;

/// Native connection pool bound to a single database target
///
/// Construction must not do I/O; the pre-warmer establishes connections.
#[async_trait]
pub trait ConnectionBackend: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Row: Send + 'static;

    /// Lease a connection, queueing until one is free
    async fn acquire(&self) -> Result<Self::Connection>;

    /// Run one statement on a leased connection
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Self::Row>>;

    /// Hand a leased connection back to the pool
    fn release(&self, conn: Self::Connection) -> Result<()>;

    /// Physical connections currently open (idle + leased)
    fn size(&self) -> u32;

    /// Physical connections currently idle
    fn num_idle(&self) -> usize;

    /// Close every connection; outstanding leases are closed on return
    async fn close(&self);
}
