#![allow(dead_code, unused_imports, unused_variables)]
//! 公共测试模块聚合
//!
//! - certs: rcgen 自签证书与 rustls 服务端配置
//! - mock_proxy: 基于线程的 SOCKS5 / HTTP CONNECT / HTTPS 代理桩，可在隧道内再终结目的端 TLS

pub mod certs;
pub mod mock_proxy;

use std::time::Duration;

use proxy_tunnel::core::config::TunnelConfig;

pub fn init_test_logging() {
    proxy_tunnel::logging::init_logging();
}

/// 短超时、快速退避的测试配置
pub fn fast_config() -> TunnelConfig {
    let mut cfg = TunnelConfig::default();
    cfg.timeouts.connect_ms = 2_000;
    cfg.timeouts.proxy_tls_ms = 2_000;
    cfg.timeouts.handshake_ms = 2_000;
    cfg.timeouts.destination_tls_ms = 2_000;
    cfg.timeouts.io_ms = 5_000;
    cfg.retry.base_delay_ms = 10;
    cfg.retry.max_delay_ms = 40;
    cfg.retry.jitter_fraction = 0.0;
    cfg.pool.acquire_timeout_ms = 2_000;
    cfg
}

pub const SHORT: Duration = Duration::from_millis(300);
