use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::core::config::model::RetryCfg;
use crate::core::proxy::errors::{ErrorCategory, TunnelError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delays are perturbed by up to ±this fraction.
    pub jitter_fraction: f64,
    pub retryable: Vec<ErrorCategory>,
    /// CONNECT statuses that are retried instead of failing fast.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryCfg::default().into()
    }
}

impl From<RetryCfg> for RetryPolicy {
    fn from(c: RetryCfg) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            jitter_fraction: c.jitter_fraction.clamp(0.0, 1.0),
            retryable: default_retryable(),
            retryable_statuses: c.retryable_statuses,
        }
    }
}

fn default_retryable() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Reset,
        ErrorCategory::TransientProtocol,
    ]
}

pub fn is_retryable(policy: &RetryPolicy, err: &TunnelError) -> bool {
    match err {
        TunnelError::ProxyRejected { status_code, .. } => {
            policy.retryable_statuses.contains(status_code)
        }
        other => policy.retryable.contains(&other.category()),
    }
}

/// Un-jittered delay before retry `n` (1 for the first retry):
/// `min(max_delay, base_delay * 2^(n-1))`.
pub fn backoff_base(policy: &RetryPolicy, n: u32) -> Duration {
    let exp = n.saturating_sub(1).min(31);
    let delay = policy.base_delay.saturating_mul(1u32 << exp);
    delay.min(policy.max_delay)
}

/// Jittered delay before retry `n`, within ±`jitter_fraction` of [`backoff_base`].
pub fn backoff_delay(policy: &RetryPolicy, n: u32) -> Duration {
    let base = backoff_base(policy, n);
    let j = policy.jitter_fraction;
    if j <= 0.0 || base.is_zero() {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-j..=j);
    base.mul_f64(factor.max(0.0))
}

/// Re-runs a whole tunnel attempt while failures stay retryable.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide whether to run another attempt after `attempt` failed with `err`.
    fn next_delay(&self, attempt: u32, err: &TunnelError) -> Option<Duration> {
        let retryable = is_retryable(&self.policy, err);
        if !retryable || attempt >= self.policy.max_attempts {
            tracing::warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                retryable,
                error = %err,
                error_category = err.category().as_str(),
                "Giving up on tunnel"
            );
            return None;
        }
        let delay = backoff_delay(&self.policy, attempt);
        tracing::warn!(
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            error_category = err.category().as_str(),
            "Tunnel attempt failed, retrying"
        );
        Some(delay)
    }

    pub fn run_blocking<T, F>(&self, mut op: F) -> Result<T, TunnelError>
    where
        F: FnMut(u32) -> Result<T, TunnelError>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) => match self.next_delay(attempt, &e) {
                    Some(delay) => std::thread::sleep(delay),
                    None => return Err(e),
                },
            }
            attempt += 1;
        }
    }

    /// Async twin of [`run_blocking`](Self::run_blocking). Dropping the returned future cancels
    /// both the running attempt and any pending backoff.
    pub async fn run_async<T, F, Fut>(&self, mut op: F) -> Result<T, TunnelError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TunnelError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => match self.next_delay(attempt, &e) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                },
            }
            attempt += 1;
        }
    }
}
