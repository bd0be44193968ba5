pub mod client;
pub mod config;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod tls;
