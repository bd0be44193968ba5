//! Proxy configuration value object and gateway credential construction

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use super::errors::TunnelError;

/// Userinfo escaping: everything but RFC 3986 unreserved characters.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Gateway product; selects the default host and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProduct {
    Residential,
    Mobile,
    Datacenter,
    Isp,
}

impl Default for ProxyProduct {
    fn default() -> Self {
        Self::Residential
    }
}

impl ProxyProduct {
    pub fn default_host(self) -> &'static str {
        match self {
            ProxyProduct::Residential => "pr.thordata.net",
            ProxyProduct::Mobile => "m.pr.thordata.net",
            ProxyProduct::Datacenter => "dc.pr.thordata.net",
            ProxyProduct::Isp => "isp.pr.thordata.net",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            ProxyProduct::Residential => 9999,
            ProxyProduct::Mobile => 5555,
            ProxyProduct::Datacenter => 7777,
            ProxyProduct::Isp => 6666,
        }
    }
}

/// How the username sent to the proxy is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStyle {
    /// `td-customer-<user>` followed by geo-targeting and session modifiers.
    Gateway,
    /// Username passed through verbatim (static ISP endpoints, generic upstream proxies).
    Raw,
}

impl Default for CredentialStyle {
    fn default() -> Self {
        Self::Gateway
    }
}

const CUSTOMER_PREFIX: &str = "td-customer-";
const CONTINENTS: [&str; 7] = ["af", "an", "as", "eu", "na", "oc", "sa"];

/// Proxy configuration as handed over by the configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    /// `http`, `https`, `socks5` or `socks5h`
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub product: ProxyProduct,

    /// Gateway host; the product default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub credential_style: CredentialStyle,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,

    /// Sticky-session id; keeps the same egress IP while it lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Sticky-session lifetime in minutes (1-90).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<u32>,
}

fn default_protocol() -> String {
    "https".to_string()
}

impl ProxySettings {
    /// Gateway credentials for `product` with every modifier unset.
    pub fn new(
        product: ProxyProduct,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            protocol: default_protocol(),
            product,
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Raw credentials for a fixed endpoint (static ISP or any third-party proxy).
    pub fn static_endpoint(
        protocol: &str,
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            protocol: protocol.to_string(),
            product: ProxyProduct::Isp,
            host: Some(host.into()),
            port: Some(port),
            username,
            password,
            credential_style: CredentialStyle::Raw,
            ..Default::default()
        }
    }

    /// Sticky session lasting `duration_minutes`; a 12-hex-char session id is generated when
    /// `session_id` is `None`.
    pub fn sticky(
        product: ProxyProduct,
        username: impl Into<String>,
        password: impl Into<String>,
        duration_minutes: u32,
        session_id: Option<String>,
    ) -> Self {
        let session_id = session_id.unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            id[..12].to_string()
        });
        Self {
            session_id: Some(session_id),
            session_duration: Some(duration_minutes),
            ..Self::new(product, username, password)
        }
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = Some(country.to_string());
        self
    }

    pub fn effective_host(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| self.product.default_host().to_string())
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.product.default_port())
    }

    /// Check modifier combinations before anything touches the network.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if !matches!(
            self.protocol.to_ascii_lowercase().as_str(),
            "http" | "https" | "socks5" | "socks5h"
        ) {
            return Err(TunnelError::config(format!(
                "Invalid protocol: {}",
                self.protocol
            )));
        }

        if let Some(duration) = self.session_duration {
            if !(1..=90).contains(&duration) {
                return Err(TunnelError::config(
                    "session_duration must be between 1 and 90 minutes",
                ));
            }
            if self.session_id.as_deref().map_or(true, str::is_empty) {
                return Err(TunnelError::config("session_duration requires session_id"));
            }
        }

        if self.asn.is_some() && self.country.is_none() {
            return Err(TunnelError::config("ASN targeting requires country"));
        }

        if let Some(continent) = &self.continent {
            if !CONTINENTS.contains(&continent.to_ascii_lowercase().as_str()) {
                return Err(TunnelError::config(format!(
                    "Invalid continent code: {continent}"
                )));
            }
        }

        if let Some(country) = &self.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(TunnelError::config("Invalid country code"));
            }
        }

        match (&self.username, &self.password, self.credential_style) {
            (None, _, CredentialStyle::Gateway) => {
                Err(TunnelError::config("Gateway proxy requires a username"))
            }
            (Some(u), _, _) if u.is_empty() => {
                Err(TunnelError::config("Proxy username cannot be empty"))
            }
            (Some(_), None, _) => Err(TunnelError::config(
                "Proxy password is required when a username is set",
            )),
            _ => Ok(()),
        }
    }

    /// Username as sent on the wire, with geo-targeting and session modifiers applied.
    pub fn build_username(&self) -> Option<String> {
        let user = self.username.as_ref()?;
        if self.credential_style == CredentialStyle::Raw {
            return Some(user.clone());
        }

        let base = if user.starts_with(CUSTOMER_PREFIX) {
            user.clone()
        } else {
            format!("{CUSTOMER_PREFIX}{user}")
        };
        let mut parts = vec![base];

        if let Some(v) = &self.continent {
            parts.push(format!("continent-{}", v.to_lowercase()));
        }
        if let Some(v) = &self.country {
            parts.push(format!("country-{}", v.to_lowercase()));
        }
        if let Some(v) = &self.state {
            parts.push(format!("state-{}", v.to_lowercase()));
        }
        if let Some(v) = &self.city {
            parts.push(format!("city-{}", v.to_lowercase()));
        }
        if let Some(v) = &self.asn {
            let upper = v.to_uppercase();
            let asn = if upper.starts_with("AS") {
                upper
            } else {
                format!("AS{upper}")
            };
            parts.push(format!("asn-{asn}"));
        }
        if let Some(v) = &self.session_id {
            parts.push(format!("sessid-{v}"));
        }
        if let Some(v) = self.session_duration {
            parts.push(format!("sesstime-{v}"));
        }
        Some(parts.join("-"))
    }

    /// URL scheme to render; `socks5` becomes `socks5h` so the gateway resolves names.
    fn url_scheme(&self) -> String {
        match self.protocol.to_ascii_lowercase().as_str() {
            "socks5" => "socks5h".to_string(),
            other => other.to_string(),
        }
    }

    /// `protocol://host:port` without credentials.
    pub fn proxy_endpoint(&self) -> String {
        format!(
            "{}://{}:{}",
            self.url_scheme(),
            self.effective_host(),
            self.effective_port()
        )
    }

    /// Full proxy URL with percent-encoded credentials. Contains the password; never log it.
    pub fn proxy_url(&self) -> String {
        match (self.build_username(), &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.url_scheme(),
                utf8_percent_encode(&user, USERINFO),
                utf8_percent_encode(pass, USERINFO),
                self.effective_host(),
                self.effective_port()
            ),
            _ => self.proxy_endpoint(),
        }
    }
}
