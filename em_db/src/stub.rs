//! ABOUTME: In-process stub backend with injectable failures and latency
//! ABOUTME: No network calls, deterministic behaviour for tests and local development

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use em_core::{Error, Result};
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::backend::{BackendFactory, ConnectionBackend, PoolEvent, PoolEventSender, SqlParam};
use crate::config::PoolConfig;

/// Leased stub connection; holds one slot of the pool's capacity
#[derive(Debug)]
pub struct StubConnection {
    pub id: u64,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Default)]
struct StubState {
    slots: Mutex<Option<Arc<Semaphore>>>,
    events: Mutex<Option<PoolEventSender>>,
    idle: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    open_connections: AtomicU32,
    leased: AtomicU32,
    peak_leased: AtomicU32,
    connects: AtomicU64,
    acquire_attempts: AtomicU64,
    executions: AtomicU64,
    fail_acquire: AtomicBool,
    fail_query: AtomicBool,
    fail_release: AtomicBool,
    closed: AtomicBool,
    acquire_delay: Mutex<Duration>,
    query_delay: Mutex<Duration>,
}

/// Stub pool; clones share state so a test can steer the instance the manager owns
#[derive(Debug, Clone, Default)]
pub struct StubBackend {
    state: Arc<StubState>,
}

impl StubBackend {
    pub fn new() -> Self {
        debug!("Creating stub database backend");
        Self::default()
    }

    /// Factory for `PoolManager::with_factory` that binds this stub to the manager
    pub fn factory(&self) -> BackendFactory<StubBackend> {
        let stub = self.clone();
        Box::new(move |config: &PoolConfig, events: PoolEventSender| -> Result<StubBackend> {
            stub.attach(config, events);
            Ok(stub.clone())
        })
    }

    fn attach(&self, config: &PoolConfig, events: PoolEventSender) {
        let permits = config.max_connections as usize;
        *lock(&self.state.slots) = Some(Arc::new(Semaphore::new(permits)));
        *lock(&self.state.events) = Some(events);
        lock(&self.state.idle).clear();
        self.state.open_connections.store(0, Ordering::SeqCst);
        self.state.closed.store(false, Ordering::SeqCst);
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.state.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_query(&self, fail: bool) {
        self.state.fail_query.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.state.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        *lock(&self.state.acquire_delay) = delay;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *lock(&self.state.query_delay) = delay;
    }

    /// Raise a pool-level error event as the native pool would
    pub fn emit_error(&self, message: &str) {
        self.emit(PoolEvent::Error(message.to_string()));
    }

    /// Physical connections ever established
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Calls that reached the backend's acquire path
    pub fn acquire_attempts(&self) -> u64 {
        self.state.acquire_attempts.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> u64 {
        self.state.executions.load(Ordering::SeqCst)
    }

    pub fn leased(&self) -> u32 {
        self.state.leased.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously leased connections observed
    pub fn peak_leased(&self) -> u32 {
        self.state.peak_leased.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(events) = lock(&self.state.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn slots(&self) -> Result<Arc<Semaphore>> {
        lock(&self.state.slots)
            .clone()
            .ok_or_else(|| Error::Acquire("stub backend not attached".to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ConnectionBackend for StubBackend {
    type Connection = StubConnection;
    type Row = serde_json::Value;

    async fn acquire(&self) -> Result<Self::Connection> {
        self.state.acquire_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.state.acquire_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Acquire("pool closed".to_string()));
        }
        if self.state.fail_acquire.load(Ordering::SeqCst) {
            return Err(Error::Acquire("connection refused".to_string()));
        }

        let permit = self
            .slots()?
            .acquire_owned()
            .await
            .map_err(|_| Error::Acquire("pool closed".to_string()))?;

        let reused = lock(&self.state.idle).pop();
        let id = match reused {
            Some(id) => id,
            None => {
                self.state.connects.fetch_add(1, Ordering::SeqCst);
                self.state.open_connections.fetch_add(1, Ordering::SeqCst);
                self.emit(PoolEvent::Connected);
                self.state.next_id.fetch_add(1, Ordering::SeqCst)
            }
        };

        let leased = self.state.leased.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_leased.fetch_max(leased, Ordering::SeqCst);

        Ok(StubConnection {
            id,
            _permit: permit,
        })
    }

    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Self::Row>> {
        self.state.executions.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.state.query_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.fail_query.load(Ordering::SeqCst) {
            return Err(Error::Query(format!("stub rejected statement: {}", sql)));
        }

        Ok(vec![json!({
            "connection": conn.id,
            "sql": sql,
            "params": params.len(),
        })])
    }

    fn release(&self, conn: Self::Connection) -> Result<()> {
        self.state.leased.fetch_sub(1, Ordering::SeqCst);

        if self.state.closed.load(Ordering::SeqCst) {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
            self.emit(PoolEvent::Removed);
        } else {
            lock(&self.state.idle).push(conn.id);
        }

        if self.state.fail_release.load(Ordering::SeqCst) {
            return Err(Error::Database("stub release failure".to_string()));
        }
        Ok(())
    }

    fn size(&self) -> u32 {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    fn num_idle(&self) -> usize {
        lock(&self.state.idle).len()
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if let Ok(slots) = self.slots() {
            slots.close();
        }
        let drained = std::mem::take(&mut *lock(&self.state.idle));
        for _ in &drained {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
            self.emit(PoolEvent::Removed);
        }
        debug!(closed = drained.len(), "Stub backend closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn attached(max: u32) -> (StubBackend, crate::backend::PoolEventReceiver) {
        let stub = StubBackend::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = (stub.factory())(&PoolConfig::for_url("postgres://stub", 0, max), tx).unwrap();
        (backend, rx)
    }

    #[tokio::test]
    async fn test_reuses_idle_connections() {
        let (stub, mut events) = attached(2);

        let conn = stub.acquire().await.unwrap();
        stub.release(conn).unwrap();
        let conn = stub.acquire().await.unwrap();
        stub.release(conn).unwrap();

        assert_eq!(stub.connects(), 1);
        assert_eq!(stub.size(), 1);
        assert_eq!(stub.num_idle(), 1);
        assert_eq!(events.recv().await, Some(PoolEvent::Connected));
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let (stub, _events) = attached(1);

        let held = stub.acquire().await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), stub.acquire()).await;
        assert!(blocked.is_err(), "second acquire should wait for a free slot");

        stub.release(held).unwrap();
        assert_eq!(stub.peak_leased(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (stub, _events) = attached(1);

        stub.set_fail_acquire(true);
        assert!(matches!(stub.acquire().await, Err(Error::Acquire(_))));
        stub.set_fail_acquire(false);

        let mut conn = stub.acquire().await.unwrap();
        stub.set_fail_query(true);
        assert!(matches!(
            stub.execute(&mut conn, "SELECT 1", &[]).await,
            Err(Error::Query(_))
        ));

        stub.set_fail_release(true);
        assert!(stub.release(conn).is_err());
        assert_eq!(stub.leased(), 0);
    }

    #[tokio::test]
    async fn test_close_drops_idle_connections() {
        let (stub, _events) = attached(2);

        let conn = stub.acquire().await.unwrap();
        stub.release(conn).unwrap();
        stub.close().await;

        assert!(stub.is_closed());
        assert_eq!(stub.size(), 0);
        assert!(stub.acquire().await.is_err());
    }
}
