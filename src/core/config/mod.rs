pub mod loader;
pub mod model;

pub use model::{HttpConnectCfg, PoolCfg, RetryCfg, TimeoutCfg, TlsCfg, TunnelConfig};
