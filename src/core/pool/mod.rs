//! Tunnel handle pool keyed by session identity and destination authority
//!
//! Two front-ends share the idle bookkeeping below: [`BlockingPool`] (`Mutex` + `Condvar`) and
//! [`AsyncPool`] (`Mutex` + one `Semaphore` per key). Both cap concurrent leases per key at
//! `maxInUsePerKey`, never hand out a handle that is known broken, and close idle handles once
//! they outlive `idleTtlSecs`.

pub mod async_pool;
pub mod blocking;

pub use async_pool::{AsyncLease, AsyncPool};
pub use blocking::{BlockingLease, BlockingPool};

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::core::proxy::handle::TunnelHandle;
use crate::core::proxy::state::TunnelState;
use crate::core::proxy::target::{ProxyTarget, SessionKey, TunnelRequest};

/// Pool partition: session digest plus destination authority.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub session: SessionKey,
    pub authority: String,
}

impl PoolKey {
    pub fn new(target: &ProxyTarget, request: &TunnelRequest) -> Self {
        Self {
            session: SessionKey::derive(target, request),
            authority: request.authority().to_ascii_lowercase(),
        }
    }

    pub fn of<S>(handle: &TunnelHandle<S>) -> Self {
        Self::new(handle.target(), handle.request())
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session, self.authority)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
}

/// Idle handles of one key, oldest first.
pub(crate) struct IdleQueue<S> {
    handles: VecDeque<TunnelHandle<S>>,
}

impl<S> Default for IdleQueue<S> {
    fn default() -> Self {
        Self {
            handles: VecDeque::new(),
        }
    }
}

impl<S> IdleQueue<S> {
    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close and drop handles idle for longer than `ttl`. Returns how many were evicted.
    pub(crate) fn evict_expired(&mut self, ttl: Duration) -> usize {
        let before = self.handles.len();
        self.handles.retain_mut(|h| {
            if h.idle_for() > ttl {
                h.close();
                false
            } else {
                true
            }
        });
        before - self.handles.len()
    }

    /// Most recently used healthy handle; dead ones found on the way are closed.
    pub(crate) fn pop_healthy(&mut self) -> Option<TunnelHandle<S>> {
        while let Some(mut handle) = self.handles.pop_back() {
            if handle.probe_alive() {
                handle.set_state(TunnelState::InUse);
                return Some(handle);
            }
            tracing::debug!(session = %handle.session_key(), "Dropping dead pooled tunnel");
            handle.close();
        }
        None
    }

    /// Park a released handle. Broken handles and overflow beyond `max_idle` are closed.
    pub(crate) fn park(&mut self, mut handle: TunnelHandle<S>, max_idle: usize) {
        if !handle.is_healthy() || handle.is_closed() {
            handle.close();
            return;
        }
        handle.touch();
        handle.set_state(TunnelState::Pooled);
        self.handles.push_back(handle);
        while self.handles.len() > max_idle {
            if let Some(mut oldest) = self.handles.pop_front() {
                oldest.close();
            }
        }
    }
}
