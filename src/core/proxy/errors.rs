//! Tunnel error types for classification and handling

use std::fmt;
use std::io;

use thiserror::Error;

/// Pipeline phase a failure (or a deadline) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Resolve,
    Connect,
    ProxyTls,
    Handshake,
    DestinationTls,
    PoolAcquire,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Resolve => "resolve",
            Phase::Connect => "connect",
            Phase::ProxyTls => "proxy_tls",
            Phase::Handshake => "handshake",
            Phase::DestinationTls => "destination_tls",
            Phase::PoolAcquire => "pool_acquire",
        };
        f.write_str(s)
    }
}

/// Which of the two TLS sessions failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsLeg {
    Proxy,
    Destination,
}

impl TlsLeg {
    pub fn phase(self) -> Phase {
        match self {
            TlsLeg::Proxy => Phase::ProxyTls,
            TlsLeg::Destination => Phase::DestinationTls,
        }
    }
}

impl fmt::Display for TlsLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsLeg::Proxy => f.write_str("proxy"),
            TlsLeg::Destination => f.write_str("destination"),
        }
    }
}

/// SOCKS5 CONNECT reply codes (RFC 1928 §6), excluding success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Socks5Reply {
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unassigned(u8),
}

impl Socks5Reply {
    /// Map a non-zero REP byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Socks5Reply::GeneralFailure,
            0x02 => Socks5Reply::ConnectionNotAllowed,
            0x03 => Socks5Reply::NetworkUnreachable,
            0x04 => Socks5Reply::HostUnreachable,
            0x05 => Socks5Reply::ConnectionRefused,
            0x06 => Socks5Reply::TtlExpired,
            0x07 => Socks5Reply::CommandNotSupported,
            0x08 => Socks5Reply::AddressTypeNotSupported,
            other => Socks5Reply::Unassigned(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Socks5Reply::GeneralFailure => 0x01,
            Socks5Reply::ConnectionNotAllowed => 0x02,
            Socks5Reply::NetworkUnreachable => 0x03,
            Socks5Reply::HostUnreachable => 0x04,
            Socks5Reply::ConnectionRefused => 0x05,
            Socks5Reply::TtlExpired => 0x06,
            Socks5Reply::CommandNotSupported => 0x07,
            Socks5Reply::AddressTypeNotSupported => 0x08,
            Socks5Reply::Unassigned(code) => code,
        }
    }

    /// Replies describing network conditions on the proxy side that may clear up on their own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Socks5Reply::NetworkUnreachable | Socks5Reply::HostUnreachable | Socks5Reply::TtlExpired
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            Socks5Reply::GeneralFailure => "General SOCKS server failure",
            Socks5Reply::ConnectionNotAllowed => "Connection not allowed by ruleset",
            Socks5Reply::NetworkUnreachable => "Network unreachable",
            Socks5Reply::HostUnreachable => "Host unreachable",
            Socks5Reply::ConnectionRefused => "Connection refused",
            Socks5Reply::TtlExpired => "TTL expired",
            Socks5Reply::CommandNotSupported => "Command not supported",
            Socks5Reply::AddressTypeNotSupported => "Address type not supported",
            Socks5Reply::Unassigned(_) => "Unknown SOCKS error",
        }
    }
}

/// Subcode carried by [`TunnelError::HandshakeProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeCode {
    /// Non-success REP byte in the SOCKS5 CONNECT reply.
    Socks5Reply(Socks5Reply),
    /// VER byte other than 0x05 in a SOCKS5 reply.
    Socks5Version(u8),
    /// The proxy selected a method that was not offered.
    Socks5Method(u8),
    /// Unknown ATYP in the CONNECT reply.
    Socks5AddressType(u8),
    /// CONNECT response head exceeded the configured bound without a blank line.
    HttpHeadTooLarge,
    /// Proxy closed the connection in the middle of the CONNECT response head.
    HttpHeadTruncated,
    /// Status line or header block could not be parsed.
    HttpMalformed,
}

impl HandshakeCode {
    pub fn is_transient(self) -> bool {
        match self {
            HandshakeCode::Socks5Reply(reply) => reply.is_transient(),
            _ => false,
        }
    }
}

impl fmt::Display for HandshakeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeCode::Socks5Reply(reply) => write!(f, "socks5_reply_0x{:02x}", reply.code()),
            HandshakeCode::Socks5Version(v) => write!(f, "socks5_version_0x{v:02x}"),
            HandshakeCode::Socks5Method(m) => write!(f, "socks5_method_0x{m:02x}"),
            HandshakeCode::Socks5AddressType(a) => write!(f, "socks5_atyp_0x{a:02x}"),
            HandshakeCode::HttpHeadTooLarge => f.write_str("http_head_too_large"),
            HandshakeCode::HttpHeadTruncated => f.write_str("http_head_truncated"),
            HandshakeCode::HttpMalformed => f.write_str("http_malformed"),
        }
    }
}

/// Coarse failure category used by retry classification and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Config,
    Network,
    Auth,
    Protocol,
    TransientProtocol,
    Rejected,
    Tls,
    Timeout,
    Reset,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::TransientProtocol => "transient_protocol",
            ErrorCategory::Rejected => "rejected",
            ErrorCategory::Tls => "tls",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Reset => "reset",
        }
    }
}

/// Every failure the tunnel pipeline can surface.
///
/// Messages never contain proxy passwords; the `proxy` fields hold
/// [`ProxyTarget::sanitized_url`](super::ProxyTarget::sanitized_url).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Proxy {proxy} unreachable: {reason}")]
    ProxyUnreachable { proxy: String, reason: String },

    #[error("Proxy authentication failed: {0}")]
    ProxyAuthFailed(String),

    #[error("Handshake protocol error [{code}]: {message}")]
    HandshakeProtocol { code: HandshakeCode, message: String },

    #[error("Proxy rejected CONNECT with status {status_code}")]
    ProxyRejected {
        status_code: u16,
        reason: String,
        body_snippet: String,
    },

    #[error("TLS negotiation failed on {leg} leg: {reason}")]
    TlsNegotiationFailed { leg: TlsLeg, reason: String },

    #[error("Timeout during {phase} after {elapsed_ms}ms")]
    Timeout { phase: Phase, elapsed_ms: u64 },

    #[error("Connection reset during {phase}: {reason}")]
    ConnectionReset { phase: Phase, reason: String },

    #[error("Failed to resolve destination '{host}': {reason}")]
    DestinationLookup { host: String, reason: String },
}

impl TunnelError {
    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Configuration(msg.into())
    }

    pub fn unreachable(proxy: impl Into<String>, reason: impl Into<String>) -> Self {
        TunnelError::ProxyUnreachable {
            proxy: proxy.into(),
            reason: reason.into(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        TunnelError::ProxyAuthFailed(msg.into())
    }

    pub fn protocol(code: HandshakeCode, msg: impl Into<String>) -> Self {
        TunnelError::HandshakeProtocol {
            code,
            message: msg.into(),
        }
    }

    pub fn tls(leg: TlsLeg, reason: impl Into<String>) -> Self {
        TunnelError::TlsNegotiationFailed {
            leg,
            reason: reason.into(),
        }
    }

    pub fn timeout(phase: Phase, elapsed: std::time::Duration) -> Self {
        TunnelError::Timeout {
            phase,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn reset(phase: Phase, reason: impl Into<String>) -> Self {
        TunnelError::ConnectionReset {
            phase,
            reason: reason.into(),
        }
    }

    /// Classify an I/O error raised while running `phase`.
    ///
    /// Deadline expiry maps to `Timeout`, peer teardown to `ConnectionReset`, and rustls
    /// failures (surfaced as `InvalidData`) on a TLS phase to `TlsNegotiationFailed`.
    pub fn from_io(phase: Phase, err: &io::Error, elapsed: std::time::Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::timeout(phase, elapsed),
            io::ErrorKind::InvalidData if phase == Phase::ProxyTls => {
                Self::tls(TlsLeg::Proxy, err.to_string())
            }
            io::ErrorKind::InvalidData if phase == Phase::DestinationTls => {
                Self::tls(TlsLeg::Destination, err.to_string())
            }
            _ => Self::reset(phase, err.to_string()),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::Configuration(_) => ErrorCategory::Config,
            TunnelError::ProxyUnreachable { .. } => ErrorCategory::Network,
            TunnelError::DestinationLookup { .. } => ErrorCategory::Network,
            TunnelError::ProxyAuthFailed(_) => ErrorCategory::Auth,
            TunnelError::HandshakeProtocol { code, .. } if code.is_transient() => {
                ErrorCategory::TransientProtocol
            }
            TunnelError::HandshakeProtocol { .. } => ErrorCategory::Protocol,
            TunnelError::ProxyRejected { .. } => ErrorCategory::Rejected,
            TunnelError::TlsNegotiationFailed { .. } => ErrorCategory::Tls,
            TunnelError::Timeout { .. } => ErrorCategory::Timeout,
            TunnelError::ConnectionReset { .. } => ErrorCategory::Reset,
        }
    }

    /// Phase the failure is attributed to, when one is known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TunnelError::Configuration(_) => Some(Phase::Resolve),
            TunnelError::ProxyUnreachable { .. } => Some(Phase::Connect),
            TunnelError::ProxyAuthFailed(_)
            | TunnelError::HandshakeProtocol { .. }
            | TunnelError::ProxyRejected { .. }
            | TunnelError::DestinationLookup { .. } => Some(Phase::Handshake),
            TunnelError::TlsNegotiationFailed { leg, .. } => Some(leg.phase()),
            TunnelError::Timeout { phase, .. } | TunnelError::ConnectionReset { phase, .. } => {
                Some(*phase)
            }
        }
    }
}
