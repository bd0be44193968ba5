#[path = "common/mod.rs"]
mod common;

use std::io::{Read, Write};

use common::certs::{LegCerts, DEST_HOST};
use common::mock_proxy::{MockProxy, Upstream};
use common::{fast_config, init_test_logging};
use proxy_tunnel::core::proxy::{Phase, ProxyScheme, ProxyTarget, TlsLeg, TunnelError, TunnelRequest};
use proxy_tunnel::core::tls::TlsLegs;
use proxy_tunnel::TunnelClient;

fn echo<S: Read + Write>(stream: &mut S, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn https_target(port: u16) -> ProxyTarget {
    ProxyTarget::new(ProxyScheme::Https, "localhost", port, None).unwrap()
}

#[test]
fn tls_in_tls_through_https_proxy() {
    init_test_logging();
    let certs = LegCerts::new();
    let proxy = MockProxy::http()
        .proxy_tls(certs.proxy.server_config())
        .upstream(Upstream::TlsEcho(
            certs.destination.server_config_with_alpn(&["h2"]),
        ))
        .spawn();

    let mut cfg = fast_config();
    cfg.tls.alpn_protocols = vec!["h2".into(), "http/1.1".into()];
    let legs = TlsLegs::with_roots(
        &cfg.tls,
        &[certs.proxy.cert.clone()],
        &[certs.destination.cert.clone()],
    )
    .unwrap();
    let client = TunnelClient::with_tls(cfg, legs);

    let mut handle = client
        .open(
            &https_target(proxy.port()),
            &TunnelRequest::new(DEST_HOST, 443, true),
        )
        .unwrap();
    assert_eq!(echo(&mut handle, b"GET / HTTP/1.1\r\n\r\n"), b"GET / HTTP/1.1\r\n\r\n");

    let seen = proxy.requests();
    assert_eq!(seen[0].proxy_sni.as_deref(), Some("localhost"));
    assert!(seen[0].head.starts_with("CONNECT dest.test:443 HTTP/1.1\r\n"));
    let dest = proxy.destination_tls();
    assert_eq!(dest[0].sni.as_deref(), Some(DEST_HOST));
    assert_eq!(dest[0].alpn.as_deref(), Some(&b"h2"[..]));
}

#[test]
fn proxy_leg_trusts_only_its_own_roots() {
    init_test_logging();
    let certs = LegCerts::new();
    let proxy = MockProxy::http()
        .proxy_tls(certs.proxy.server_config())
        .upstream(Upstream::TlsEcho(certs.destination.server_config()))
        .spawn();

    let cfg = fast_config();
    // Proxy certificate only trusted for the destination leg.
    let legs = TlsLegs::with_roots(
        &cfg.tls,
        &[certs.destination.cert.clone()],
        &[certs.proxy.cert.clone()],
    )
    .unwrap();
    let client = TunnelClient::with_tls(cfg, legs);

    let err = client
        .open(
            &https_target(proxy.port()),
            &TunnelRequest::new(DEST_HOST, 443, true),
        )
        .unwrap_err();
    assert!(
        matches!(err, TunnelError::TlsNegotiationFailed { leg: TlsLeg::Proxy, .. }),
        "{err:?}"
    );
    assert_eq!(proxy.accepted(), 1);
}

#[test]
fn destination_leg_verified_independently() {
    init_test_logging();
    let certs = LegCerts::new();
    let proxy = MockProxy::http()
        .proxy_tls(certs.proxy.server_config())
        .upstream(Upstream::TlsEcho(certs.destination.server_config()))
        .spawn();

    let cfg = fast_config();
    let legs = TlsLegs::with_roots(&cfg.tls, &[certs.proxy.cert.clone()], &[]).unwrap();
    let client = TunnelClient::with_tls(cfg, legs);

    let err = client
        .open(
            &https_target(proxy.port()),
            &TunnelRequest::new(DEST_HOST, 443, true),
        )
        .unwrap_err();
    assert!(
        matches!(
            err,
            TunnelError::TlsNegotiationFailed {
                leg: TlsLeg::Destination,
                ..
            }
        ),
        "{err:?}"
    );
}

#[test]
fn server_name_override_drives_sni() {
    init_test_logging();
    let certs = LegCerts::new();
    let proxy = MockProxy::socks5()
        .upstream(Upstream::TlsEcho(certs.destination.server_config()))
        .spawn();

    let cfg = fast_config();
    let legs = TlsLegs::with_roots(&cfg.tls, &[], &[certs.destination.cert.clone()]).unwrap();
    let client = TunnelClient::with_tls(cfg, legs);
    let target = ProxyTarget::new(ProxyScheme::Socks5h, "127.0.0.1", proxy.port(), None).unwrap();
    let request = TunnelRequest::new("127.0.0.1", 443, true).with_server_name(DEST_HOST);

    let mut handle = client.open(&target, &request).unwrap();
    assert_eq!(echo(&mut handle, b"hi"), b"hi");
    assert_eq!(proxy.requests()[0].atyp, Some(0x01));
    assert_eq!(proxy.destination_tls()[0].sni.as_deref(), Some(DEST_HOST));
}

#[test]
fn insecure_skip_verify_accepts_untrusted_certs() {
    init_test_logging();
    let certs = LegCerts::new();
    let proxy = MockProxy::http()
        .proxy_tls(certs.proxy.server_config())
        .upstream(Upstream::TlsEcho(certs.destination.server_config()))
        .spawn();

    let mut cfg = fast_config();
    cfg.tls.insecure_skip_verify = true;
    let client = TunnelClient::new(cfg).unwrap();
    let mut handle = client
        .open(
            &https_target(proxy.port()),
            &TunnelRequest::new(DEST_HOST, 443, true),
        )
        .unwrap();
    assert_eq!(echo(&mut handle, b"ok"), b"ok");
}

#[test]
fn stalled_destination_tls_times_out() {
    init_test_logging();
    let proxy = MockProxy::socks5().upstream(Upstream::Hang).spawn();
    let mut cfg = fast_config();
    cfg.timeouts.destination_tls_ms = 200;
    cfg.retry.max_attempts = 1;
    let client = TunnelClient::new(cfg).unwrap();
    let target = ProxyTarget::new(ProxyScheme::Socks5h, "127.0.0.1", proxy.port(), None).unwrap();

    let err = client
        .open(&target, &TunnelRequest::new(DEST_HOST, 443, true))
        .unwrap_err();
    assert!(
        matches!(
            err,
            TunnelError::Timeout {
                phase: Phase::DestinationTls,
                ..
            }
        ),
        "{err:?}"
    );
}
