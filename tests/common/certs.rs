use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};

/// 自签证书（DER）及其私钥
#[derive(Clone)]
pub struct TestCert {
    pub cert: Certificate,
    pub key: PrivateKey,
}

impl TestCert {
    pub fn new(host: &str) -> Self {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .expect("generate self-signed cert");
        Self {
            cert: Certificate(generated.serialize_der().expect("serialize cert")),
            key: PrivateKey(generated.serialize_private_key_der()),
        }
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        let cfg = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], self.key.clone())
            .expect("server config");
        Arc::new(cfg)
    }

    pub fn server_config_with_alpn(&self, alpn: &[&str]) -> Arc<ServerConfig> {
        let mut cfg = (*self.server_config()).clone();
        cfg.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Arc::new(cfg)
    }
}

/// 代理端（localhost）与目的端（dest.test）两张互不相关的证书
pub struct LegCerts {
    pub proxy: TestCert,
    pub destination: TestCert,
}

impl LegCerts {
    pub fn new() -> Self {
        Self {
            proxy: TestCert::new("localhost"),
            destination: TestCert::new("dest.test"),
        }
    }
}

pub const DEST_HOST: &str = "dest.test";
