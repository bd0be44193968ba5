//! Client front-ends owning one config, one pair of TLS legs, one pool and one retry executor.

use std::sync::OnceLock;

use crate::core::config::TunnelConfig;
use crate::core::pool::{AsyncLease, AsyncPool, BlockingLease, BlockingPool, PoolKey};
use crate::core::proxy::config::ProxySettings;
use crate::core::proxy::connector::{AsyncConnector, BlockingConnector};
use crate::core::proxy::errors::TunnelError;
use crate::core::proxy::handle::{AsyncStream, BlockingStream, TunnelHandle};
use crate::core::proxy::resolver;
use crate::core::proxy::target::{ProxyTarget, TunnelRequest};
use crate::core::retry::RetryExecutor;
use crate::core::tls::TlsLegs;

/// Blocking tunnel client.
pub struct TunnelClient {
    config: TunnelConfig,
    connector: BlockingConnector,
    pool: BlockingPool,
    retry: RetryExecutor,
}

impl TunnelClient {
    /// Client trusting the webpki roots on both legs.
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let tls = TlsLegs::from_config(&config.tls)?;
        Ok(Self::with_tls(config, tls))
    }

    /// The pool's reaper thread exits on its first sweep after the client is dropped.
    pub fn with_tls(config: TunnelConfig, tls: TlsLegs) -> Self {
        let connector =
            BlockingConnector::new(config.timeouts.clone(), config.http_connect.clone(), tls);
        let pool = BlockingPool::new(config.pool.clone());
        pool.spawn_reaper(config.pool.reap_interval());
        Self {
            pool,
            retry: RetryExecutor::new(config.retry.clone().into()),
            connector,
            config,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn pool(&self) -> &BlockingPool {
        &self.pool
    }

    /// Build a fresh tunnel (with retries), bypassing the pool.
    pub fn open(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
    ) -> Result<TunnelHandle<BlockingStream>, TunnelError> {
        self.retry
            .run_blocking(|_| self.connector.open(target, request))
    }

    /// Resolve `settings` + `url`, then [`open`](Self::open).
    pub fn open_url(
        &self,
        settings: &ProxySettings,
        url: &str,
    ) -> Result<TunnelHandle<BlockingStream>, TunnelError> {
        let (target, request) = resolver::resolve(settings, url)?;
        self.open(&target, &request)
    }

    /// Lease a pooled tunnel, building one (with retries) when nothing idle matches.
    pub fn acquire(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
    ) -> Result<BlockingLease, TunnelError> {
        let key = PoolKey::new(target, request);
        self.pool.acquire(key, || self.open(target, request))
    }

    pub fn acquire_url(
        &self,
        settings: &ProxySettings,
        url: &str,
    ) -> Result<BlockingLease, TunnelError> {
        let (target, request) = resolver::resolve(settings, url)?;
        self.acquire(&target, &request)
    }

    pub fn release(&self, lease: BlockingLease) {
        self.pool.release(lease);
    }
}

/// Async tunnel client over tokio.
pub struct AsyncTunnelClient {
    config: TunnelConfig,
    connector: AsyncConnector,
    pool: AsyncPool,
    retry: RetryExecutor,
    reaper: OnceLock<tokio::task::JoinHandle<()>>,
}

impl AsyncTunnelClient {
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let tls = TlsLegs::from_config(&config.tls)?;
        Ok(Self::with_tls(config, tls))
    }

    /// Starts the pool reaper when called inside a tokio runtime, otherwise on the first
    /// [`acquire`](Self::acquire).
    pub fn with_tls(config: TunnelConfig, tls: TlsLegs) -> Self {
        let connector =
            AsyncConnector::new(config.timeouts.clone(), config.http_connect.clone(), tls);
        let client = Self {
            pool: AsyncPool::new(config.pool.clone()),
            retry: RetryExecutor::new(config.retry.clone().into()),
            reaper: OnceLock::new(),
            connector,
            config,
        };
        client.ensure_reaper();
        client
    }

    fn ensure_reaper(&self) {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.reaper
                .get_or_init(|| self.pool.spawn_reaper(self.config.pool.reap_interval()));
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn pool(&self) -> &AsyncPool {
        &self.pool
    }

    pub async fn open(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
    ) -> Result<TunnelHandle<AsyncStream>, TunnelError> {
        self.retry
            .run_async(|_| self.connector.open(target, request))
            .await
    }

    pub async fn open_url(
        &self,
        settings: &ProxySettings,
        url: &str,
    ) -> Result<TunnelHandle<AsyncStream>, TunnelError> {
        let (target, request) = resolver::resolve(settings, url)?;
        self.open(&target, &request).await
    }

    pub async fn acquire(
        &self,
        target: &ProxyTarget,
        request: &TunnelRequest,
    ) -> Result<AsyncLease, TunnelError> {
        self.ensure_reaper();
        let key = PoolKey::new(target, request);
        self.pool.acquire(key, || self.open(target, request)).await
    }

    pub async fn acquire_url(
        &self,
        settings: &ProxySettings,
        url: &str,
    ) -> Result<AsyncLease, TunnelError> {
        let (target, request) = resolver::resolve(settings, url)?;
        self.acquire(&target, &request).await
    }

    pub fn release(&self, lease: AsyncLease) {
        self.pool.release(lease);
    }
}

impl Drop for AsyncTunnelClient {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get() {
            reaper.abort();
        }
    }
}
