//! Proxy tunnelling: targets, the SOCKS5 and HTTP CONNECT handshake engines and the pipeline
//! that layers them with TLS.
//!
//! Scheme dispatch is a match on [`ProxyScheme`]; the engines take `&mut` streams, so handshake
//! bytes on one connection are strictly ordered.

pub mod acquire;
pub mod config;
pub mod connector;
pub mod errors;
pub mod handle;
pub mod http_connect;
pub mod lookup;
pub mod resolver;
pub mod socks5;
pub mod state;
pub mod target;

pub use config::{CredentialStyle, ProxyProduct, ProxySettings};
pub use connector::{AsyncConnector, BlockingConnector};
pub use errors::{ErrorCategory, HandshakeCode, Phase, Socks5Reply, TlsLeg, TunnelError};
pub use handle::{AsyncStream, BlockingStream, TunnelHandle};
pub use state::TunnelState;
pub use target::{Credentials, ProxyScheme, ProxyTarget, SessionKey, SessionToken, TunnelRequest};
