//! Raw TCP connection to the proxy under the connect-phase deadline

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::errors::{Phase, TunnelError};
use super::lookup;
use super::target::ProxyTarget;
use crate::core::config::TimeoutCfg;

fn proxy_addrs(
    proxy: &str,
    resolved: lookup::LookupResult,
) -> Result<Vec<SocketAddr>, TunnelError> {
    let addrs = resolved.map_err(|e| {
        TunnelError::unreachable(proxy, format!("Failed to resolve proxy address: {e}"))
    })?;
    if addrs.is_empty() {
        return Err(TunnelError::unreachable(proxy, "No addresses resolved for proxy"));
    }
    Ok(addrs)
}

/// Resolve the proxy under the resolve budget, then connect, trying each address until the
/// connect budget runs out.
pub fn connect_blocking(
    target: &ProxyTarget,
    timeouts: &TimeoutCfg,
) -> Result<TcpStream, TunnelError> {
    let proxy = target.sanitized_url();
    let resolved = lookup::lookup_blocking(target.host(), target.port(), timeouts.resolve())?;
    let addrs = proxy_addrs(&proxy, resolved)?;

    let start = Instant::now();
    let budget = timeouts.connect();
    let mut last_err = None;
    for addr in addrs {
        let remaining = budget.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(TunnelError::timeout(Phase::Connect, start.elapsed()));
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!(
                    proxy.url = %proxy,
                    proxy.addr = %addr,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "TCP connection to proxy established"
                );
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(proxy.addr = %addr, error = %e, "Proxy address failed");
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => {
            Err(TunnelError::timeout(Phase::Connect, start.elapsed()))
        }
        Some(e) => Err(TunnelError::unreachable(&proxy, format!("Proxy connection failed: {e}"))),
        None => Err(TunnelError::unreachable(&proxy, "No addresses resolved for proxy")),
    }
}

pub async fn connect_async(
    target: &ProxyTarget,
    timeouts: &TimeoutCfg,
) -> Result<tokio::net::TcpStream, TunnelError> {
    let proxy = target.sanitized_url();
    let resolved = lookup::lookup_async(target.host(), target.port(), timeouts.resolve()).await?;
    let addrs = proxy_addrs(&proxy, resolved)?;

    let start = Instant::now();
    let connect = tokio::net::TcpStream::connect(&addrs[..]);
    match tokio::time::timeout(timeouts.connect(), connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            tracing::debug!(
                proxy.url = %proxy,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "TCP connection to proxy established"
            );
            Ok(stream)
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
            Err(TunnelError::timeout(Phase::Connect, start.elapsed()))
        }
        Ok(Err(e)) => Err(TunnelError::unreachable(
            &proxy,
            format!("Proxy connection failed: {e}"),
        )),
        Err(_) => Err(TunnelError::timeout(Phase::Connect, start.elapsed())),
    }
}

/// Shared deadline for the phase currently running on a [`DeadlineStream`].
#[derive(Debug, Clone, Default)]
pub struct PhaseDeadline(Arc<Mutex<Option<Instant>>>);

impl PhaseDeadline {
    pub fn start(&self, budget: Duration) {
        self.set(Some(Instant::now() + budget));
    }

    pub fn clear(&self) {
        self.set(None);
    }

    fn set(&self, value: Option<Instant>) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard = value;
    }

    fn get(&self) -> Option<Instant> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Raw proxy socket whose reads and writes are bounded by the remaining phase budget rather
/// than a per-call timeout, so a proxy trickling bytes cannot stretch a phase.
#[derive(Debug)]
pub struct DeadlineStream {
    inner: TcpStream,
    deadline: PhaseDeadline,
}

impl DeadlineStream {
    pub fn new(inner: TcpStream, deadline: PhaseDeadline) -> Self {
        Self { inner, deadline }
    }

    fn arm(&self) -> io::Result<()> {
        let Some(deadline) = self.deadline.get() else {
            return Ok(());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "phase deadline elapsed"));
        }
        self.inner.set_read_timeout(Some(remaining))?;
        self.inner.set_write_timeout(Some(remaining))
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
