//! ABOUTME: One-shot pre-warm of the minimum connection set
//! ABOUTME: Leases and validates connections sequentially, then hands them all back

use std::time::Duration;

use em_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::backend::ConnectionBackend;

/// Establish and validate `count` connections before the pool takes traffic
///
/// Connections stay leased until every one has answered `SELECT 1`, which
/// forces the backend to open `count` distinct physical connections. On the
/// first failure everything leased so far is released and the error returned.
pub async fn prewarm<B: ConnectionBackend>(
    backend: &B,
    count: u32,
    acquire_timeout: Duration,
) -> Result<u32> {
    let mut leased = Vec::with_capacity(count as usize);

    for index in 0..count {
        match warm_one(backend, acquire_timeout).await {
            Ok(conn) => {
                debug!(connection = index + 1, of = count, "Pre-warmed connection validated");
                leased.push(conn);
            }
            Err(e) => {
                warn!(
                    warmed = leased.len(),
                    target = count,
                    error = %e,
                    "Pre-warm failed, releasing leased connections"
                );
                release_all(backend, leased);
                return Err(e);
            }
        }
    }

    let warmed = leased.len() as u32;
    release_all(backend, leased);
    info!(connections = warmed, "Pre-warmed connection pool");
    Ok(warmed)
}

async fn warm_one<B: ConnectionBackend>(
    backend: &B,
    acquire_timeout: Duration,
) -> Result<B::Connection> {
    let mut conn = tokio::time::timeout(acquire_timeout, backend.acquire())
        .await
        .map_err(|_| Error::AcquireTimeout(acquire_timeout))??;

    if let Err(e) = backend.execute(&mut conn, "SELECT 1", &[]).await {
        release_all(backend, vec![conn]);
        return Err(e);
    }
    Ok(conn)
}

fn release_all<B: ConnectionBackend>(backend: &B, leased: Vec<B::Connection>) {
    for conn in leased {
        if let Err(e) = backend.release(conn) {
            warn!(error = %e, "Failed to release pre-warmed connection");
        }
    }
}
