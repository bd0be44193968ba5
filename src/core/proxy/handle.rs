//! Negotiated tunnel handle

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::socks5::BoundAddr;
use super::state::TunnelState;
use super::target::{ProxyTarget, SessionKey, TunnelRequest};

/// Blocking byte stream after any combination of TLS layers.
pub trait BlockingIo: Read + Write + Send {}
impl<T: Read + Write + Send> BlockingIo for T {}

pub type BlockingStream = Box<dyn BlockingIo>;

/// Async byte stream after any combination of TLS layers.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type AsyncStream = Box<dyn AsyncIo>;

/// A live tunnel: the negotiated stream plus the identity it was built for.
///
/// Target and request never change after construction. Any I/O error marks the handle
/// unhealthy so the pool discards it instead of lending it again.
pub struct TunnelHandle<S> {
    stream: Option<S>,
    target: ProxyTarget,
    request: TunnelRequest,
    key: SessionKey,
    bound: Option<BoundAddr>,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    state: TunnelState,
    /// Duplicate of the raw proxy socket (blocking model) for shutdown and liveness probes.
    raw: Option<TcpStream>,
}

impl<S> TunnelHandle<S> {
    pub(crate) fn new(
        stream: S,
        target: ProxyTarget,
        request: TunnelRequest,
        bound: Option<BoundAddr>,
        raw: Option<TcpStream>,
    ) -> Self {
        let now = Instant::now();
        let key = SessionKey::derive(&target, &request);
        Self {
            stream: Some(stream),
            target,
            request,
            key,
            bound,
            created_at: now,
            last_used: now,
            healthy: true,
            state: TunnelState::Ready,
            raw,
        }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn request(&self) -> &TunnelRequest {
        &self.request
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// Address the SOCKS5 proxy reported as bound for the tunnel.
    pub fn bound_addr(&self) -> Option<&BoundAddr> {
        self.bound.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.stream.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == TunnelState::Closed
    }

    /// Flag the handle as unusable; it is closed instead of pooled on release.
    pub fn mark_broken(&mut self) {
        if self.healthy {
            tracing::debug!(session = %self.key, "Tunnel marked broken");
        }
        self.healthy = false;
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Detach the stream; the handle is closed afterwards.
    pub fn into_stream(mut self) -> Option<S> {
        let stream = self.stream.take();
        self.raw = None;
        self.set_state(TunnelState::Closed);
        stream
    }

    /// Close the stream and the underlying socket. Idempotent.
    pub fn close(&mut self) {
        if self.state == TunnelState::Closed {
            return;
        }
        if let Some(raw) = self.raw.take() {
            let _ = raw.shutdown(Shutdown::Both);
        }
        self.stream = None;
        self.healthy = false;
        self.set_state(TunnelState::Closed);
        tracing::debug!(
            session = %self.key,
            age_ms = self.created_at.elapsed().as_millis() as u64,
            "Tunnel closed"
        );
    }

    /// Cheap liveness check on the raw socket: a peer FIN or socket error means dead.
    /// Handles without a raw socket duplicate only report their health flag; async ones are
    /// checked with [`check_alive`](Self::check_alive).
    pub fn probe_alive(&self) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let Some(raw) = &self.raw else {
            return true;
        };
        if raw.set_nonblocking(true).is_err() {
            return false;
        }
        let mut buf = [0u8; 1];
        let alive = match raw.peek(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        };
        raw.set_nonblocking(false).is_ok() && alive
    }

    pub(crate) fn set_state(&mut self, next: TunnelState) {
        if let Err(e) = self.state.advance(next) {
            tracing::warn!(session = %self.key, error = %e, "Ignoring tunnel state change");
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "tunnel closed")
    }

    fn track<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &res {
            if !matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) {
                self.mark_broken();
            }
        }
        res
    }
}

impl<S: AsyncRead + Unpin> TunnelHandle<S> {
    /// Liveness check for an idle async tunnel: a single read poll must come back pending.
    /// EOF, an error or unsolicited bytes mark the handle broken.
    pub async fn check_alive(&mut self) -> bool {
        if !self.probe_alive() {
            return false;
        }
        std::future::poll_fn(|cx| Poll::Ready(self.poll_idle(cx))).await
    }

    fn poll_idle(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let alive = match Pin::new(stream).poll_read(cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) => false,
            Poll::Ready(Err(e)) => {
                tracing::debug!(session = %self.key, error = %e, "Idle tunnel read failed");
                false
            }
        };
        if !alive {
            self.mark_broken();
        }
        alive
    }
}

impl<S> std::fmt::Debug for TunnelHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("proxy", &self.target.sanitized_url())
            .field("destination", &self.request.authority())
            .field("session", &self.key)
            .field("state", &self.state)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl<S: Read> Read for TunnelHandle<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = match self.stream.as_mut() {
            Some(s) => s.read(buf),
            None => Err(Self::closed_error()),
        };
        self.track(res)
    }
}

impl<S: Write> Write for TunnelHandle<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = match self.stream.as_mut() {
            Some(s) => s.write(buf),
            None => Err(Self::closed_error()),
        };
        self.track(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        let res = match self.stream.as_mut() {
            Some(s) => s.flush(),
            None => Err(Self::closed_error()),
        };
        self.track(res)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelHandle<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.stream.as_mut() {
            Some(s) => ready!(Pin::new(s).poll_read(cx, buf)),
            None => Err(Self::closed_error()),
        };
        Poll::Ready(this.track(res))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelHandle<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = match this.stream.as_mut() {
            Some(s) => ready!(Pin::new(s).poll_write(cx, buf)),
            None => Err(Self::closed_error()),
        };
        Poll::Ready(this.track(res))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.stream.as_mut() {
            Some(s) => ready!(Pin::new(s).poll_flush(cx)),
            None => Err(Self::closed_error()),
        };
        Poll::Ready(this.track(res))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.stream.as_mut() {
            Some(s) => ready!(Pin::new(s).poll_shutdown(cx)),
            None => Ok(()),
        };
        this.healthy = false;
        Poll::Ready(res)
    }
}

impl<S> Drop for TunnelHandle<S> {
    fn drop(&mut self) {
        self.close();
    }
}
