pub mod core;
pub mod logging;

pub use crate::core::client::{AsyncTunnelClient, TunnelClient};
pub use crate::core::config::TunnelConfig;
pub use crate::core::proxy::{
    ProxyProduct, ProxyScheme, ProxySettings, ProxyTarget, TunnelError, TunnelHandle,
    TunnelRequest,
};
pub use crate::core::retry::{RetryExecutor, RetryPolicy};
