//! Tunnel lifecycle state machine

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Lifecycle of a single tunnel, from raw connect to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Uninitialized,
    Connecting,
    /// TLS to the proxy itself (secure proxy scheme only)
    ProxyTls,
    Handshaking,
    /// TLS to the destination through the tunnel
    DestinationTls,
    Ready,
    InUse,
    Pooled,
    Closed,
    Failed,
}

impl Default for TunnelState {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::ProxyTls => "proxy_tls",
            Self::Handshaking => "handshaking",
            Self::DestinationTls => "destination_tls",
            Self::Ready => "ready",
            Self::InUse => "in_use",
            Self::Pooled => "pooled",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl TunnelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if the state transition is valid
    pub fn can_transition_to(&self, next: TunnelState) -> bool {
        use TunnelState::*;

        matches!(
            (self, next),
            (Uninitialized, Connecting) |
            // Secure proxies negotiate TLS before the handshake
            (Connecting, ProxyTls) |
            (Connecting, Handshaking) |
            (ProxyTls, Handshaking) |
            (Handshaking, DestinationTls) |
            (Handshaking, Ready) |
            (DestinationTls, Ready) |
            (Ready, InUse) |
            (Ready, Pooled) |
            (InUse, Pooled) |
            (Pooled, InUse) |
            (Ready | InUse | Pooled | Failed, Closed)
        ) || (next == Failed && !matches!(self, Closed | Failed))
    }

    /// Apply a transition, rejecting edges the lifecycle does not have.
    pub fn advance(&mut self, next: TunnelState) -> Result<()> {
        if *self == next {
            return Ok(());
        }
        if !self.can_transition_to(next) {
            anyhow::bail!("Invalid tunnel state transition: {} -> {}", self, next);
        }
        tracing::trace!(from = %self, to = %next, "Tunnel state transition");
        *self = next;
        Ok(())
    }
}
