//! Name resolution bounded by the resolve-phase budget
//!
//! The system resolver has no deadline of its own, so the blocking model runs it on a worker
//! thread and stops waiting once the budget is spent; the async model wraps `lookup_host` in
//! `tokio::time::timeout`. Expiry is the only `Err`; lookup failures come back in the inner
//! result so callers can classify them (proxy unreachable vs destination lookup).

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use super::errors::{Phase, TunnelError};

pub type LookupResult = io::Result<Vec<SocketAddr>>;

fn system_lookup(host: &str, port: u16) -> LookupResult {
    Ok((host, port).to_socket_addrs()?.collect())
}

fn literal(host: &str, port: u16) -> Option<Vec<SocketAddr>> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    trimmed
        .parse::<IpAddr>()
        .ok()
        .map(|ip| vec![SocketAddr::new(ip, port)])
}

pub fn lookup_blocking(
    host: &str,
    port: u16,
    budget: Duration,
) -> Result<LookupResult, TunnelError> {
    lookup_blocking_with(host, port, budget, system_lookup)
}

/// Run `lookup` on a worker thread and wait at most `budget` for it. IP literals skip the thread.
pub fn lookup_blocking_with<F>(
    host: &str,
    port: u16,
    budget: Duration,
    lookup: F,
) -> Result<LookupResult, TunnelError>
where
    F: FnOnce(&str, u16) -> LookupResult + Send + 'static,
{
    if let Some(addrs) = literal(host, port) {
        return Ok(Ok(addrs));
    }
    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    let owned = host.to_string();
    let spawned = std::thread::Builder::new()
        .name("tunnel-resolve".into())
        .spawn(move || {
            // Receiver is gone once the budget expired.
            let _ = tx.send(lookup(&owned, port));
        });
    if let Err(e) = spawned {
        return Ok(Err(e));
    }

    match rx.recv_timeout(budget) {
        Ok(res) => Ok(res),
        Err(RecvTimeoutError::Timeout) => {
            tracing::debug!(
                host,
                budget_ms = budget.as_millis() as u64,
                "Name resolution timed out"
            );
            Err(TunnelError::timeout(Phase::Resolve, start.elapsed()))
        }
        Err(RecvTimeoutError::Disconnected) => Ok(Err(io::Error::new(
            io::ErrorKind::Other,
            "resolver thread exited without a result",
        ))),
    }
}

pub async fn lookup_async(
    host: &str,
    port: u16,
    budget: Duration,
) -> Result<LookupResult, TunnelError> {
    if let Some(addrs) = literal(host, port) {
        return Ok(Ok(addrs));
    }
    lookup_async_with(budget, async move {
        tokio::net::lookup_host((host, port))
            .await
            .map(|addrs| addrs.collect())
    })
    .await
}

/// Bound an async lookup by `budget`.
pub async fn lookup_async_with<F>(budget: Duration, lookup: F) -> Result<LookupResult, TunnelError>
where
    F: Future<Output = LookupResult>,
{
    let start = Instant::now();
    tokio::time::timeout(budget, lookup)
        .await
        .map_err(|_| TunnelError::timeout(Phase::Resolve, start.elapsed()))
}
