use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use super::{IdleQueue, PoolKey, PoolStats};
use crate::core::config::PoolCfg;
use crate::core::proxy::errors::{Phase, TunnelError};
use crate::core::proxy::handle::{BlockingStream, TunnelHandle};
use crate::core::proxy::state::TunnelState;

struct Entry {
    idle: IdleQueue<BlockingStream>,
    in_use: usize,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            idle: IdleQueue::default(),
            in_use: 0,
        }
    }
}

struct Shared {
    cfg: PoolCfg,
    entries: Mutex<HashMap<PoolKey, Entry>>,
    released: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn give_back(&self, key: &PoolKey, handle: Option<TunnelHandle<BlockingStream>>) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.in_use = entry.in_use.saturating_sub(1);
            if let Some(handle) = handle {
                entry.idle.park(handle, self.cfg.max_idle_per_key);
            }
        } else if let Some(mut handle) = handle {
            handle.close();
        }
        drop(entries);
        self.released.notify_all();
    }

    fn purge(&self) -> usize {
        let ttl = self.cfg.idle_ttl();
        let mut entries = self.lock();
        let mut evicted = 0;
        for entry in entries.values_mut() {
            evicted += entry.idle.evict_expired(ttl);
        }
        entries.retain(|_, e| e.in_use > 0 || !e.idle.is_empty());
        evicted
    }
}

/// Thread-safe pool for blocking tunnels. Cloning shares the same pool.
#[derive(Clone)]
pub struct BlockingPool {
    shared: Arc<Shared>,
}

impl BlockingPool {
    pub fn new(cfg: PoolCfg) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                entries: Mutex::new(HashMap::new()),
                released: Condvar::new(),
            }),
        }
    }

    /// Lease a tunnel for `key`: an idle healthy one if available, otherwise one built by
    /// `open`. Blocks while `maxInUsePerKey` leases are out, up to the acquire timeout.
    ///
    /// `open` runs without the pool lock held, so building a tunnel for one key never stalls
    /// another key.
    pub fn acquire<F>(&self, key: PoolKey, open: F) -> Result<BlockingLease, TunnelError>
    where
        F: FnOnce() -> Result<TunnelHandle<BlockingStream>, TunnelError>,
    {
        let cfg = &self.shared.cfg;
        let start = Instant::now();
        let deadline = start + cfg.acquire_timeout();
        let limit = cfg.max_in_use_per_key.max(1);

        let mut entries = self.shared.lock();
        loop {
            let entry = entries.entry(key.clone()).or_default();
            entry.idle.evict_expired(cfg.idle_ttl());
            if entry.in_use < limit {
                entry.in_use += 1;
                if let Some(handle) = entry.idle.pop_healthy() {
                    drop(entries);
                    tracing::debug!(pool.key = %key, "Reusing pooled tunnel");
                    return Ok(BlockingLease::new(&self.shared, key, handle));
                }
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TunnelError::timeout(Phase::PoolAcquire, start.elapsed()));
            }
            entries = self
                .shared
                .released
                .wait_timeout(entries, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        drop(entries);

        match open() {
            Ok(mut handle) => {
                handle.set_state(TunnelState::InUse);
                Ok(BlockingLease::new(&self.shared, key, handle))
            }
            Err(e) => {
                self.shared.give_back(&key, None);
                Err(e)
            }
        }
    }

    /// Return a leased handle; healthy ones go back to idle, broken ones are closed.
    pub fn release(&self, lease: BlockingLease) {
        lease.release();
    }

    /// Close every idle handle past its TTL. Returns the number closed.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge()
    }

    pub fn stats(&self, key: &PoolKey) -> PoolStats {
        self.shared
            .lock()
            .get(key)
            .map(|e| PoolStats {
                idle: e.idle.len(),
                in_use: e.in_use,
            })
            .unwrap_or_default()
    }

    /// Background thread closing expired idle handles every `interval`. Stops once the pool is
    /// dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> std::thread::JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let evicted = shared.purge();
            if evicted > 0 {
                tracing::debug!(evicted, "Closed expired pooled tunnels");
            }
        })
    }
}

/// Exclusive lease on a pooled tunnel. Dropping it without [`release`](Self::release) closes
/// the tunnel, since its stream position is unknown.
pub struct BlockingLease {
    handle: Option<TunnelHandle<BlockingStream>>,
    key: PoolKey,
    pool: Weak<Shared>,
}

impl BlockingLease {
    fn new(shared: &Arc<Shared>, key: PoolKey, handle: TunnelHandle<BlockingStream>) -> Self {
        Self {
            handle: Some(handle),
            key,
            pool: Arc::downgrade(shared),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn release(mut self) {
        let handle = self.handle.take();
        self.finish(handle);
    }

    /// Detach the tunnel from the pool entirely.
    pub fn detach(mut self) -> Option<TunnelHandle<BlockingStream>> {
        let handle = self.handle.take();
        self.finish(None);
        handle
    }

    fn finish(&mut self, handle: Option<TunnelHandle<BlockingStream>>) {
        match self.pool.upgrade() {
            Some(shared) => shared.give_back(&self.key, handle),
            None => {
                if let Some(mut handle) = handle {
                    handle.close();
                }
            }
        }
    }
}

impl Deref for BlockingLease {
    type Target = TunnelHandle<BlockingStream>;

    fn deref(&self) -> &Self::Target {
        // Only `release`/`detach`, which consume the lease, take the handle.
        self.handle.as_ref().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl DerefMut for BlockingLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_mut().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl Drop for BlockingLease {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            self.finish(None);
        }
    }
}

impl std::fmt::Debug for BlockingLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingLease").field("key", &self.key).finish()
    }
}
