//! Client TLS over an arbitrary byte stream, used for both the proxy leg and the destination
//! leg. The destination leg wraps the tunneled stream, so two nested sessions can be active.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

use rustls::{ClientConfig, ClientConnection, ServerName, StreamOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::core::proxy::errors::{TlsLeg, TunnelError};

pub fn server_name(host: &str, leg: TlsLeg) -> Result<ServerName, TunnelError> {
    ServerName::try_from(host)
        .map_err(|_| TunnelError::tls(leg, format!("Invalid server name '{host}'")))
}

/// Complete a client handshake over a blocking stream. Read/write deadlines on the underlying
/// socket bound the handshake.
pub fn wrap_blocking<S: Read + Write>(
    config: Arc<ClientConfig>,
    host: &str,
    leg: TlsLeg,
    mut stream: S,
) -> Result<StreamOwned<ClientConnection, S>, TunnelError> {
    let start = Instant::now();
    let name = server_name(host, leg)?;
    let mut conn = ClientConnection::new(config, name)
        .map_err(|e| TunnelError::tls(leg, e.to_string()))?;
    let io_err = |e: std::io::Error| TunnelError::from_io(leg.phase(), &e, start.elapsed());

    while conn.is_handshaking() {
        conn.complete_io(&mut stream).map_err(io_err)?;
    }
    // complete_io can return before the final handshake flight is written
    while conn.wants_write() {
        conn.write_tls(&mut stream).map_err(io_err)?;
    }
    stream.flush().map_err(io_err)?;

    tracing::debug!(
        tls.leg = %leg,
        sni = %host,
        alpn = ?conn.alpn_protocol().map(String::from_utf8_lossy),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "TLS session established"
    );
    Ok(StreamOwned::new(conn, stream))
}

/// Async twin of [`wrap_blocking`]; the caller bounds it with the leg's deadline.
pub async fn wrap_async<S: AsyncRead + AsyncWrite + Unpin>(
    config: Arc<ClientConfig>,
    host: &str,
    leg: TlsLeg,
    stream: S,
) -> Result<TlsStream<S>, TunnelError> {
    let start = Instant::now();
    let name = server_name(host, leg)?;
    let tls = TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| TunnelError::from_io(leg.phase(), &e, start.elapsed()))?;
    tracing::debug!(
        tls.leg = %leg,
        sni = %host,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "TLS session established"
    );
    Ok(tls)
}
