// tracing 初始化；重复调用是安全的
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging() {
    // 若已经初始化，避免重复 panic
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!(target = "tunnel", "tracing initialized");
    }
}
