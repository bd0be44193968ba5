//! HTTP CONNECT handshake engine
//!
//! Sends `CONNECT host:port HTTP/1.1` with a `Host` header and optional Basic
//! `Proxy-Authorization`, then reads the response head one byte at a time so that nothing past
//! the blank line is consumed: whatever follows belongs to the tunnel.

use std::io::{Read, Write};
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::errors::{HandshakeCode, Phase, TunnelError};
use super::target::{Credentials, TunnelRequest};
use crate::core::config::HttpConnectCfg;

const MAX_HEADERS: usize = 64;

/// Parsed CONNECT response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: u16,
    pub reason: String,
    pub content_length: Option<usize>,
}

impl ConnectResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Basic authentication header value. Sent whenever a username is configured, even with an
/// empty password.
pub fn basic_auth(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.username, credentials.password);
    format!("Basic {}", STANDARD.encode(raw.as_bytes()))
}

pub fn encode_request(request: &TunnelRequest, credentials: Option<&Credentials>) -> String {
    let authority = request.authority();
    let mut out = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(creds) = credentials {
        out.push_str("Proxy-Authorization: ");
        out.push_str(&basic_auth(creds));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Accumulates the response head until `\r\n\r\n`, enforcing the size bound.
#[derive(Debug)]
pub struct HeadReader {
    buf: Vec<u8>,
    limit: usize,
}

impl HeadReader {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(1024)),
            limit,
        }
    }

    /// Feed one byte; `Ok(true)` once the blank line has been seen.
    pub fn push(&mut self, byte: u8) -> Result<bool, TunnelError> {
        self.buf.push(byte);
        if self.buf.ends_with(b"\r\n\r\n") {
            return Ok(true);
        }
        if self.buf.len() >= self.limit {
            return Err(TunnelError::protocol(
                HandshakeCode::HttpHeadTooLarge,
                format!("CONNECT response head exceeds {} bytes", self.limit),
            ));
        }
        Ok(false)
    }

    /// EOF before the blank line.
    pub fn eof(&self, elapsed: std::time::Duration) -> TunnelError {
        if self.buf.is_empty() {
            TunnelError::reset(
                Phase::Handshake,
                format!("Proxy closed connection before responding ({}ms)", elapsed.as_millis()),
            )
        } else {
            TunnelError::protocol(
                HandshakeCode::HttpHeadTruncated,
                format!("Proxy closed connection after {} header bytes", self.buf.len()),
            )
        }
    }

    pub fn head(&self) -> &[u8] {
        &self.buf
    }
}

pub fn parse_head(head: &[u8]) -> Result<ConnectResponse, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let malformed =
        |msg: String| TunnelError::protocol(HandshakeCode::HttpMalformed, msg);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(malformed("Incomplete CONNECT response head".to_string()))
        }
        Err(e) => return Err(malformed(format!("Invalid proxy response: {e}"))),
    }

    let status = response
        .code
        .ok_or_else(|| malformed("Missing status code".to_string()))?;
    let reason = response.reason.unwrap_or_default().to_string();
    let content_length = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok());

    Ok(ConnectResponse {
        status,
        reason,
        content_length,
    })
}

fn rejected(response: ConnectResponse, body: &[u8]) -> TunnelError {
    tracing::warn!(
        status_code = response.status,
        reason = %response.reason,
        "Proxy rejected CONNECT"
    );
    TunnelError::ProxyRejected {
        status_code: response.status,
        reason: response.reason,
        body_snippet: String::from_utf8_lossy(body).into_owned(),
    }
}

fn snippet_len(response: &ConnectResponse, cfg: &HttpConnectCfg) -> usize {
    response
        .content_length
        .unwrap_or(0)
        .min(cfg.body_snippet_bytes)
}

/// Run CONNECT over a blocking stream (raw TCP or the proxy-leg TLS session).
pub fn handshake<S: Read + Write>(
    stream: &mut S,
    request: &TunnelRequest,
    credentials: Option<&Credentials>,
    cfg: &HttpConnectCfg,
) -> Result<ConnectResponse, TunnelError> {
    let start = Instant::now();
    let io_err = |e: std::io::Error| TunnelError::from_io(Phase::Handshake, &e, start.elapsed());

    let wire = encode_request(request, credentials);
    stream.write_all(wire.as_bytes()).map_err(io_err)?;
    stream.flush().map_err(io_err)?;
    tracing::debug!(
        target.host = %request.host,
        target.port = request.port,
        with_auth = credentials.is_some(),
        "Sent CONNECT request"
    );

    let mut head = HeadReader::new(cfg.max_header_bytes);
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Err(head.eof(start.elapsed())),
            Ok(_) => {
                if head.push(byte[0])? {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(e)),
        }
    }

    let response = parse_head(head.head())?;
    tracing::debug!(status_code = response.status, "Received CONNECT response");
    if response.is_success() {
        return Ok(response);
    }

    let mut body = vec![0u8; snippet_len(&response, cfg)];
    let mut filled = 0;
    while filled < body.len() {
        match stream.read(&mut body[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    body.truncate(filled);
    Err(rejected(response, &body))
}

/// Async twin of [`handshake`]; the caller bounds it with the handshake deadline.
pub async fn handshake_async<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    request: &TunnelRequest,
    credentials: Option<&Credentials>,
    cfg: &HttpConnectCfg,
) -> Result<ConnectResponse, TunnelError> {
    let start = Instant::now();
    let io_err = |e: std::io::Error| TunnelError::from_io(Phase::Handshake, &e, start.elapsed());

    let wire = encode_request(request, credentials);
    stream.write_all(wire.as_bytes()).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    let mut head = HeadReader::new(cfg.max_header_bytes);
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) => return Err(head.eof(start.elapsed())),
            Ok(_) => {
                if head.push(byte[0])? {
                    break;
                }
            }
            Err(e) => return Err(io_err(e)),
        }
    }

    let response = parse_head(head.head())?;
    if response.is_success() {
        return Ok(response);
    }

    let mut body = vec![0u8; snippet_len(&response, cfg)];
    let mut filled = 0;
    while filled < body.len() {
        match stream.read(&mut body[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    body.truncate(filled);
    Err(rejected(response, &body))
}
