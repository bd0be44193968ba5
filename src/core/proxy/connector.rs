//! Tunnel pipeline: connect -> [proxy TLS] -> SOCKS5 | CONNECT -> [destination TLS]
//!
//! One attempt per call; retries and pooling happen above this layer. Every phase has its own
//! budget. A failure at any point drops every layer built so far, closing the socket.

use std::future::Future;
use std::net::Shutdown;
use std::time::{Duration, Instant};

use super::acquire::{self, DeadlineStream, PhaseDeadline};
use super::errors::{Phase, TlsLeg, TunnelError};
use super::handle::{AsyncStream, BlockingStream, TunnelHandle};
use super::http_connect;
use super::socks5::{self, BoundAddr};
use super::state::TunnelState;
use super::target::{ProxyScheme, ProxyTarget, TunnelRequest};
use crate::core::config::{HttpConnectCfg, TimeoutCfg};
use crate::core::tls::wrap::{wrap_async, wrap_blocking};
use crate::core::tls::TlsLegs;

/// Blocking pipeline over `std::net` sockets and rustls `StreamOwned`.
#[derive(Debug, Clone)]
pub struct BlockingConnector {
    timeouts: TimeoutCfg,
    http: HttpConnectCfg,
    tls: TlsLegs,
}

impl BlockingConnector {
    pub fn new(timeouts: TimeoutCfg, http: HttpConnectCfg, tls: TlsLegs) -> Self {
        Self { timeouts, http, tls }
    }

    pub fn open(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
    ) -> Result<TunnelHandle<BlockingStream>, TunnelError> {
        let start = Instant::now();
        tracing::debug!(
            proxy.url = %target.sanitized_url(),
            proxy.type = %target.scheme(),
            target.host = %request.host,
            target.port = request.port,
            requires_tls = request.requires_tls,
            "Opening tunnel"
        );

        let mut state = TunnelState::Uninitialized;
        let result = self.run(target, request, &mut state);
        match result {
            Ok((stream, bound, raw)) => {
                let handle = TunnelHandle::new(stream, target.clone(), request.clone(), bound, Some(raw));
                log_established(target, request, start.elapsed());
                Ok(handle)
            }
            Err(e) => {
                log_failure(target, request, state, &e, start.elapsed());
                Err(e)
            }
        }
    }

    fn run(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
        state: &mut TunnelState,
    ) -> Result<(BlockingStream, Option<BoundAddr>, std::net::TcpStream), TunnelError> {
        step(state, TunnelState::Connecting);
        let tcp = acquire::connect_blocking(target, &self.timeouts)?;
        let raw = tcp
            .try_clone()
            .map_err(|e| TunnelError::reset(Phase::Connect, e.to_string()))?;
        let deadline = PhaseDeadline::default();
        let guard = ShutdownOnError(Some(&raw));
        let tcp = DeadlineStream::new(tcp, deadline.clone());

        let mut stream: BlockingStream = if target.scheme().is_secure() {
            step(state, TunnelState::ProxyTls);
            deadline.start(self.timeouts.proxy_tls());
            Box::new(wrap_blocking(
                self.tls.proxy.clone(),
                target.host(),
                TlsLeg::Proxy,
                tcp,
            )?)
        } else {
            Box::new(tcp)
        };

        step(state, TunnelState::Handshaking);
        let bound = match target.scheme() {
            ProxyScheme::Http | ProxyScheme::Https => {
                deadline.start(self.timeouts.handshake());
                http_connect::handshake(&mut stream, request, target.credentials(), &self.http)?;
                None
            }
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
                let dest = socks5::resolve_destination(target, request, self.timeouts.resolve())?;
                deadline.start(self.timeouts.handshake());
                Some(socks5::negotiate(&mut stream, target, request, &dest)?)
            }
        };

        if request.requires_tls {
            step(state, TunnelState::DestinationTls);
            deadline.start(self.timeouts.destination_tls());
            stream = Box::new(wrap_blocking(
                self.tls.destination.clone(),
                &request.server_name,
                TlsLeg::Destination,
                stream,
            )?);
        }

        deadline.clear();
        let io = self.timeouts.io();
        raw.set_read_timeout(io)
            .and_then(|_| raw.set_write_timeout(io))
            .map_err(|e| TunnelError::reset(Phase::Handshake, e.to_string()))?;
        step(state, TunnelState::Ready);
        guard.disarm();
        Ok((stream, bound, raw))
    }
}

/// Cooperative pipeline over tokio sockets and tokio-rustls.
#[derive(Debug, Clone)]
pub struct AsyncConnector {
    timeouts: TimeoutCfg,
    http: HttpConnectCfg,
    tls: TlsLegs,
}

impl AsyncConnector {
    pub fn new(timeouts: TimeoutCfg, http: HttpConnectCfg, tls: TlsLegs) -> Self {
        Self { timeouts, http, tls }
    }

    pub async fn open(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
    ) -> Result<TunnelHandle<AsyncStream>, TunnelError> {
        let start = Instant::now();
        tracing::debug!(
            proxy.url = %target.sanitized_url(),
            proxy.type = %target.scheme(),
            target.host = %request.host,
            target.port = request.port,
            requires_tls = request.requires_tls,
            "Opening tunnel"
        );

        let mut state = TunnelState::Uninitialized;
        match self.run(target, request, &mut state).await {
            Ok((stream, bound)) => {
                let handle = TunnelHandle::new(stream, target.clone(), request.clone(), bound, None);
                log_established(target, request, start.elapsed());
                Ok(handle)
            }
            Err(e) => {
                log_failure(target, request, state, &e, start.elapsed());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
        state: &mut TunnelState,
    ) -> Result<(AsyncStream, Option<BoundAddr>), TunnelError> {
        step(state, TunnelState::Connecting);
        let tcp = acquire::connect_async(target, &self.timeouts).await?;

        let mut stream: AsyncStream = if target.scheme().is_secure() {
            step(state, TunnelState::ProxyTls);
            let tls = wrap_async(self.tls.proxy.clone(), target.host(), TlsLeg::Proxy, tcp);
            Box::new(within(Phase::ProxyTls, self.timeouts.proxy_tls(), tls).await?)
        } else {
            Box::new(tcp)
        };

        step(state, TunnelState::Handshaking);
        let budget = self.timeouts.handshake();
        let bound = match target.scheme() {
            ProxyScheme::Http | ProxyScheme::Https => {
                let connect = http_connect::handshake_async(
                    &mut stream,
                    request,
                    target.credentials(),
                    &self.http,
                );
                within(Phase::Handshake, budget, connect).await?;
                None
            }
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
                let dest =
                    socks5::resolve_destination_async(target, request, self.timeouts.resolve())
                        .await?;
                let socks = socks5::negotiate_async(&mut stream, target, request, &dest);
                Some(within(Phase::Handshake, budget, socks).await?)
            }
        };

        if request.requires_tls {
            step(state, TunnelState::DestinationTls);
            let tls = wrap_async(
                self.tls.destination.clone(),
                &request.server_name,
                TlsLeg::Destination,
                stream,
            );
            stream = Box::new(within(Phase::DestinationTls, self.timeouts.destination_tls(), tls).await?);
        }

        step(state, TunnelState::Ready);
        Ok((stream, bound))
    }
}

/// Bound `fut` by the phase budget. Expiry drops the future, and with it the socket.
pub async fn within<T, F>(phase: Phase, budget: Duration, fut: F) -> Result<T, TunnelError>
where
    F: Future<Output = Result<T, TunnelError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(res) => res,
        Err(_) => Err(TunnelError::timeout(phase, budget)),
    }
}

fn step(state: &mut TunnelState, next: TunnelState) {
    if let Err(e) = state.advance(next) {
        tracing::warn!(error = %e, "Unexpected pipeline state");
    }
}

/// Shuts the raw socket down unless disarmed, so a failed pipeline never leaves a half-open
/// connection behind even while an outer layer still holds the stream.
struct ShutdownOnError<'a>(Option<&'a std::net::TcpStream>);

impl ShutdownOnError<'_> {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for ShutdownOnError<'_> {
    fn drop(&mut self) {
        if let Some(raw) = self.0 {
            let _ = raw.shutdown(Shutdown::Both);
        }
    }
}

fn log_established(target: &ProxyTarget, request: &TunnelRequest, elapsed: Duration) {
    tracing::info!(
        proxy.type = %target.scheme(),
        proxy.url = %target.sanitized_url(),
        target.host = %request.host,
        target.port = request.port,
        destination_tls = request.requires_tls,
        elapsed_ms = elapsed.as_millis() as u64,
        "Tunnel established successfully"
    );
}

fn log_failure(
    target: &ProxyTarget,
    request: &TunnelRequest,
    state: TunnelState,
    err: &TunnelError,
    elapsed: Duration,
) {
    tracing::warn!(
        proxy.url = %target.sanitized_url(),
        target.host = %request.host,
        target.port = request.port,
        state = %state,
        phase = ?err.phase(),
        error = %err,
        error_category = err.category().as_str(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Tunnel pipeline failed"
    );
}
