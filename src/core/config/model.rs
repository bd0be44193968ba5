use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-phase deadlines in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutCfg {
    /// Name lookups for the proxy host, and for the destination on `socks5`.
    #[serde(default = "default_phase_ms")] pub resolve_ms: u64,
    #[serde(default = "default_phase_ms")] pub connect_ms: u64,
    #[serde(default = "default_phase_ms")] pub proxy_tls_ms: u64,
    #[serde(default = "default_phase_ms")] pub handshake_ms: u64,
    #[serde(default = "default_phase_ms")] pub destination_tls_ms: u64,
    /// Read/write timeout left on an established blocking stream; 0 disables it.
    #[serde(default = "default_io_ms")] pub io_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCfg {
    #[serde(default = "default_idle_ttl_secs")] pub idle_ttl_secs: u64,
    #[serde(default = "default_max_in_use")] pub max_in_use_per_key: usize,
    #[serde(default = "default_max_idle")] pub max_idle_per_key: usize,
    #[serde(default = "default_acquire_timeout_ms")] pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConnectCfg {
    #[serde(default = "default_max_header_bytes")] pub max_header_bytes: usize,
    #[serde(default = "default_body_snippet_bytes")] pub body_snippet_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryCfg {
    #[serde(default = "default_max_attempts")] pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")] pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")] pub max_delay_ms: u64,
    #[serde(default = "default_jitter_fraction")] pub jitter_fraction: f64,
    /// CONNECT statuses treated as retryable instead of fatal.
    #[serde(default)] pub retryable_statuses: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsCfg {
    /// Skip certificate verification on both legs. Diagnostics only.
    #[serde(default)] pub insecure_skip_verify: bool,
    /// ALPN protocols offered on the destination leg.
    #[serde(default)] pub alpn_protocols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    #[serde(default)] pub timeouts: TimeoutCfg,
    #[serde(default)] pub pool: PoolCfg,
    #[serde(default)] pub http_connect: HttpConnectCfg,
    #[serde(default)] pub retry: RetryCfg,
    #[serde(default)] pub tls: TlsCfg,
}

fn default_phase_ms() -> u64 { 10_000 }
fn default_io_ms() -> u64 { 30_000 }
fn default_idle_ttl_secs() -> u64 { 90 }
fn default_max_in_use() -> usize { 1 }
fn default_max_idle() -> usize { 4 }
fn default_acquire_timeout_ms() -> u64 { 30_000 }
fn default_max_header_bytes() -> usize { 8 * 1024 }
fn default_body_snippet_bytes() -> usize { 512 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 300 }
fn default_max_delay_ms() -> u64 { 5_000 }
fn default_jitter_fraction() -> f64 { 0.2 }

impl Default for TimeoutCfg {
    fn default() -> Self {
        Self {
            resolve_ms: default_phase_ms(),
            connect_ms: default_phase_ms(),
            proxy_tls_ms: default_phase_ms(),
            handshake_ms: default_phase_ms(),
            destination_tls_ms: default_phase_ms(),
            io_ms: default_io_ms(),
        }
    }
}

impl TimeoutCfg {
    pub fn resolve(&self) -> Duration { Duration::from_millis(self.resolve_ms) }
    pub fn connect(&self) -> Duration { Duration::from_millis(self.connect_ms) }
    pub fn proxy_tls(&self) -> Duration { Duration::from_millis(self.proxy_tls_ms) }
    pub fn handshake(&self) -> Duration { Duration::from_millis(self.handshake_ms) }
    pub fn destination_tls(&self) -> Duration { Duration::from_millis(self.destination_tls_ms) }

    pub fn io(&self) -> Option<Duration> {
        (self.io_ms > 0).then(|| Duration::from_millis(self.io_ms))
    }
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            max_in_use_per_key: default_max_in_use(),
            max_idle_per_key: default_max_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolCfg {
    pub fn idle_ttl(&self) -> Duration { Duration::from_secs(self.idle_ttl_secs) }
    pub fn acquire_timeout(&self) -> Duration { Duration::from_millis(self.acquire_timeout_ms) }

    /// Sweep period for the background reaper: half the idle TTL, kept within 250 ms..30 s.
    pub fn reap_interval(&self) -> Duration {
        (self.idle_ttl() / 2).clamp(Duration::from_millis(250), Duration::from_secs(30))
    }
}

impl Default for HttpConnectCfg {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
            body_snippet_bytes: default_body_snippet_bytes(),
        }
    }
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            retryable_statuses: Vec::new(),
        }
    }
}
