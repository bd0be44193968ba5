use std::sync::Arc;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, OwnedTrustAnchor, RootCertStore, ServerName};

use crate::core::config::model::TlsCfg;
use crate::core::proxy::errors::TunnelError;

/// 极不安全：完全跳过证书链与域名校验，仅用于诊断。
/// 当 `tls.insecure_skip_verify=true` 时启用。
pub struct InsecureCertVerifier;

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        tracing::warn!(server_name = ?server_name, "TLS certificate verification skipped");
        Ok(ServerCertVerified::assertion())
    }
}

/// webpki 根证书，外加调用方额外信任的 DER 证书（私有 CA、自签代理等）。
pub fn build_root_store(extra_roots: &[Certificate]) -> Result<RootCertStore, TunnelError> {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));
    for cert in extra_roots {
        root_store
            .add(cert)
            .map_err(|e| TunnelError::config(format!("Invalid trust anchor: {e}")))?;
    }
    Ok(root_store)
}

/// 构造单条 TLS 腿的 rustls ClientConfig（无客户端证书）。
///
/// `alpn` 只用于目的端一侧；代理一侧始终不协商 ALPN。
pub fn create_client_config(
    tls: &TlsCfg,
    extra_roots: &[Certificate],
    alpn: &[String],
) -> Result<ClientConfig, TunnelError> {
    let root_store = build_root_store(extra_roots)?;
    let mut cfg = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if tls.insecure_skip_verify {
        cfg.dangerous()
            .set_certificate_verifier(Arc::new(InsecureCertVerifier));
    }
    cfg.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(cfg)
}

/// 两条 TLS 腿各自独立的客户端配置。
#[derive(Clone)]
pub struct TlsLegs {
    pub proxy: Arc<ClientConfig>,
    pub destination: Arc<ClientConfig>,
}

impl TlsLegs {
    /// 两条腿都信任 webpki 根证书；配置中的 ALPN 只用于目的端一侧。
    pub fn from_config(tls: &TlsCfg) -> Result<Self, TunnelError> {
        Self::with_roots(tls, &[], &[])
    }

    /// 按腿追加信任锚；一侧追加的根证书不影响另一侧。
    pub fn with_roots(
        tls: &TlsCfg,
        proxy_roots: &[Certificate],
        destination_roots: &[Certificate],
    ) -> Result<Self, TunnelError> {
        Ok(Self {
            proxy: Arc::new(create_client_config(tls, proxy_roots, &[])?),
            destination: Arc::new(create_client_config(
                tls,
                destination_roots,
                &tls.alpn_protocols,
            )?),
        })
    }
}

impl std::fmt::Debug for TlsLegs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsLegs")
            .field("destination_alpn", &self.destination.alpn_protocols)
            .finish()
    }
}
