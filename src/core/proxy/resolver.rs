//! Proxy settings + destination URL -> immutable target and request. No network access.

use super::config::{CredentialStyle, ProxySettings};
use super::errors::TunnelError;
use super::target::{Credentials, ProxyScheme, ProxyTarget, SessionToken, TunnelRequest};

pub fn resolve(
    settings: &ProxySettings,
    destination: &str,
) -> Result<(ProxyTarget, TunnelRequest), TunnelError> {
    let target = resolve_target(settings)?;
    let request = TunnelRequest::from_url(destination)?;
    tracing::debug!(
        proxy.url = %target.sanitized_url(),
        target.host = %request.host,
        target.port = request.port,
        requires_tls = request.requires_tls,
        "Resolved tunnel target"
    );
    Ok((target, request))
}

pub fn resolve_target(settings: &ProxySettings) -> Result<ProxyTarget, TunnelError> {
    settings.validate()?;

    let scheme = ProxyScheme::parse(&settings.protocol).ok_or_else(|| {
        TunnelError::config(format!("Unsupported proxy scheme '{}'", settings.protocol))
    })?;

    let credentials = match settings.build_username() {
        Some(username) => Some(Credentials {
            username,
            password: settings.password.clone().unwrap_or_default(),
        }),
        None => None,
    };

    let session = match (&settings.session_id, settings.credential_style) {
        (Some(id), CredentialStyle::Gateway) => Some(SessionToken {
            id: id.clone(),
            duration_minutes: settings.session_duration,
        }),
        _ => None,
    };

    Ok(ProxyTarget::new(
        scheme,
        settings.effective_host(),
        settings.effective_port(),
        credentials,
    )?
    .with_session(session))
}
