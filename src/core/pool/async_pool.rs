use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{IdleQueue, PoolKey, PoolStats};
use crate::core::config::PoolCfg;
use crate::core::proxy::errors::{Phase, TunnelError};
use crate::core::proxy::handle::{AsyncStream, TunnelHandle};
use crate::core::proxy::state::TunnelState;

struct Entry {
    idle: IdleQueue<AsyncStream>,
    permits: Arc<Semaphore>,
}

struct Shared {
    cfg: PoolCfg,
    entries: Mutex<HashMap<PoolKey, Entry>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limit(&self) -> usize {
        self.cfg.max_in_use_per_key.max(1)
    }

    fn semaphore(&self, key: &PoolKey) -> Arc<Semaphore> {
        let limit = self.limit();
        self.lock()
            .entry(key.clone())
            .or_insert_with(|| Entry {
                idle: IdleQueue::default(),
                permits: Arc::new(Semaphore::new(limit)),
            })
            .permits
            .clone()
    }

    fn park(&self, key: &PoolKey, handle: TunnelHandle<AsyncStream>) {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => entry.idle.park(handle, self.cfg.max_idle_per_key),
            None => drop(handle),
        }
    }

    fn purge(&self) -> usize {
        let ttl = self.cfg.idle_ttl();
        let limit = self.limit();
        let mut entries = self.lock();
        let mut evicted = 0;
        for entry in entries.values_mut() {
            evicted += entry.idle.evict_expired(ttl);
        }
        // Keys with no idle handles, no leases and no waiters can go.
        entries.retain(|_, e| {
            !e.idle.is_empty()
                || Arc::strong_count(&e.permits) > 1
                || e.permits.available_permits() < limit
        });
        evicted
    }
}

/// Pool for async tunnels. Cloning shares the same pool.
#[derive(Clone)]
pub struct AsyncPool {
    shared: Arc<Shared>,
}

impl AsyncPool {
    pub fn new(cfg: PoolCfg) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Lease a tunnel for `key`, reusing an idle healthy one or building one with `open`.
    /// Waits for a per-key permit up to the acquire timeout; the permit is held by the lease.
    pub async fn acquire<F, Fut>(&self, key: PoolKey, open: F) -> Result<AsyncLease, TunnelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TunnelHandle<AsyncStream>, TunnelError>>,
    {
        let start = Instant::now();
        let semaphore = self.shared.semaphore(&key);
        let permit = match tokio::time::timeout(
            self.shared.cfg.acquire_timeout(),
            semaphore.acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TunnelError::reset(Phase::PoolAcquire, "pool closed"));
            }
            Err(_) => return Err(TunnelError::timeout(Phase::PoolAcquire, start.elapsed())),
        };

        loop {
            let candidate = {
                let mut entries = self.shared.lock();
                entries.get_mut(&key).and_then(|entry| {
                    entry.idle.evict_expired(self.shared.cfg.idle_ttl());
                    entry.idle.pop_healthy()
                })
            };
            let Some(mut handle) = candidate else {
                break;
            };
            if handle.check_alive().await {
                tracing::debug!(pool.key = %key, "Reusing pooled tunnel");
                return Ok(AsyncLease::new(&self.shared, key, handle, permit));
            }
            tracing::debug!(pool.key = %key, "Dropping dead pooled tunnel");
            handle.close();
        }

        // A failed or cancelled open drops the permit, freeing the slot.
        let mut handle = open().await?;
        handle.set_state(TunnelState::InUse);
        Ok(AsyncLease::new(&self.shared, key, handle, permit))
    }

    pub fn release(&self, lease: AsyncLease) {
        lease.release();
    }

    pub fn purge_expired(&self) -> usize {
        self.shared.purge()
    }

    pub fn stats(&self, key: &PoolKey) -> PoolStats {
        let limit = self.shared.limit();
        self.shared
            .lock()
            .get(key)
            .map(|e| PoolStats {
                idle: e.idle.len(),
                in_use: limit.saturating_sub(e.permits.available_permits()),
            })
            .unwrap_or_default()
    }

    /// Spawn a task closing expired idle handles every `interval`; it ends with the pool.
    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let evicted = shared.purge();
                if evicted > 0 {
                    tracing::debug!(evicted, "Closed expired pooled tunnels");
                }
            }
        })
    }
}

/// Exclusive lease on an async tunnel; holds the key's permit until released or dropped.
/// Dropping without [`release`](Self::release) closes the tunnel.
pub struct AsyncLease {
    handle: Option<TunnelHandle<AsyncStream>>,
    key: PoolKey,
    pool: Weak<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl AsyncLease {
    fn new(
        shared: &Arc<Shared>,
        key: PoolKey,
        handle: TunnelHandle<AsyncStream>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            handle: Some(handle),
            key,
            pool: Arc::downgrade(shared),
            _permit: permit,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Park the tunnel for reuse (closed instead if broken); the permit is returned after.
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            match self.pool.upgrade() {
                Some(shared) => shared.park(&self.key, handle),
                None => drop(handle),
            }
        }
    }

    pub fn detach(mut self) -> Option<TunnelHandle<AsyncStream>> {
        self.handle.take()
    }
}

impl Deref for AsyncLease {
    type Target = TunnelHandle<AsyncStream>;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl DerefMut for AsyncLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_mut().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl Drop for AsyncLease {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl std::fmt::Debug for AsyncLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLease").field("key", &self.key).finish()
    }
}
