//! End-to-end failure scenarios: which failures are retried and how often.

#[path = "common/mod.rs"]
mod common;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};

use common::certs::{LegCerts, DEST_HOST};
use common::mock_proxy::{MockProxy, Upstream};
use common::{fast_config, init_test_logging};
use proxy_tunnel::core::proxy::{
    Credentials, HandshakeCode, Phase, ProxyScheme, ProxyTarget, Socks5Reply, TunnelError,
    TunnelRequest,
};
use proxy_tunnel::core::tls::TlsLegs;
use proxy_tunnel::TunnelClient;

fn socks(port: u16, creds: Option<(&str, &str)>) -> ProxyTarget {
    let creds = creds.map(|(u, p)| Credentials {
        username: u.into(),
        password: p.into(),
    });
    ProxyTarget::new(ProxyScheme::Socks5h, "127.0.0.1", port, creds).unwrap()
}

fn client() -> TunnelClient {
    init_test_logging();
    TunnelClient::new(fast_config()).unwrap()
}

#[test]
fn scenario_a_socks5_auth_ok() {
    let proxy = MockProxy::socks5().credentials("td-customer-u", "pw").spawn();
    let mut handle = client()
        .open(
            &socks(proxy.port(), Some(("td-customer-u", "pw"))),
            &TunnelRequest::new("ipinfo.thordata.com", 80, false),
        )
        .unwrap();
    handle.write_all(b"GET /").unwrap();
    let mut buf = [0u8; 5];
    handle.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"GET /");
    assert_eq!(proxy.accepted(), 1);
}

#[test]
fn scenario_b_wrong_password_not_retried() {
    let proxy = MockProxy::socks5().credentials("u", "right").spawn();
    let err = client()
        .open(
            &socks(proxy.port(), Some(("u", "wrong"))),
            &TunnelRequest::new("example.com", 80, false),
        )
        .unwrap_err();
    assert!(matches!(err, TunnelError::ProxyAuthFailed(_)));
    assert_eq!(proxy.accepted(), 1);
}

#[test]
fn scenario_c_host_unreachable_retried_to_max_attempts() {
    let proxy = MockProxy::socks5().reply(0x04).spawn();
    let started = Instant::now();
    let err = client()
        .open(&socks(proxy.port(), None), &TunnelRequest::new("example.com", 80, false))
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::HandshakeProtocol {
            code: HandshakeCode::Socks5Reply(Socks5Reply::HostUnreachable),
            ..
        }
    ));
    assert_eq!(proxy.accepted(), 3);
    // Two backoffs of 10ms and 20ms happened in between.
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn scenario_c_unreachable_proxy_retried() {
    // Grab a free port, then close it so connections are refused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = client()
        .open(&socks(port, None), &TunnelRequest::new("example.com", 80, false))
        .unwrap_err();
    match &err {
        TunnelError::ProxyUnreachable { proxy, .. } => {
            assert_eq!(proxy, &format!("socks5h://127.0.0.1:{port}"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn scenario_d_connect_407_not_retried() {
    let proxy = MockProxy::http().credentials("u", "p").spawn();
    let target = ProxyTarget::new(ProxyScheme::Http, "127.0.0.1", proxy.port(), None).unwrap();
    let err = client()
        .open(&target, &TunnelRequest::new("example.com", 443, true))
        .unwrap_err();
    assert!(matches!(err, TunnelError::ProxyRejected { status_code: 407, .. }));
    assert_eq!(proxy.accepted(), 1);
}

#[test]
fn scenario_e_tls_in_tls_carries_destination_data() {
    init_test_logging();
    let certs = LegCerts::new();
    let proxy = MockProxy::http()
        .proxy_tls(certs.proxy.server_config())
        .upstream(Upstream::TlsEcho(certs.destination.server_config()))
        .spawn();
    let cfg = fast_config();
    let legs = TlsLegs::with_roots(
        &cfg.tls,
        &[certs.proxy.cert.clone()],
        &[certs.destination.cert.clone()],
    )
    .unwrap();
    let client = TunnelClient::with_tls(cfg, legs);
    let target = ProxyTarget::new(ProxyScheme::Https, "localhost", proxy.port(), None).unwrap();

    let mut handle = client
        .open(&target, &TunnelRequest::new(DEST_HOST, 443, true))
        .unwrap();
    handle.write_all(b"application-data").unwrap();
    let mut buf = [0u8; 16];
    handle.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"application-data");
    assert_eq!(proxy.destination_tls().len(), 1);
}

#[test]
fn reset_during_handshake_recovers_on_retry() {
    let proxy = MockProxy::socks5().drop_first(2).spawn();
    let mut handle = client()
        .open(&socks(proxy.port(), None), &TunnelRequest::new("example.com", 80, false))
        .unwrap();
    handle.write_all(b"z").unwrap();
    let mut buf = [0u8; 1];
    handle.read_exact(&mut buf).unwrap();
    assert_eq!(proxy.accepted(), 3);
}

#[test]
fn silent_proxy_hits_handshake_deadline() {
    init_test_logging();
    let proxy = MockProxy::socks5().silent().spawn();
    let mut cfg = fast_config();
    cfg.timeouts.handshake_ms = 150;
    cfg.retry.max_attempts = 2;
    let client = TunnelClient::new(cfg).unwrap();

    let started = Instant::now();
    let err = client
        .open(&socks(proxy.port(), None), &TunnelRequest::new("example.com", 80, false))
        .unwrap_err();
    assert!(
        matches!(err, TunnelError::Timeout { phase: Phase::Handshake, .. }),
        "{err:?}"
    );
    assert_eq!(proxy.accepted(), 2);
    assert!(started.elapsed() < Duration::from_secs(3));
}
