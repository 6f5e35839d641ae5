//! # Pool Configuration

use std::time::Duration;

use rand::Rng;

use crate::vote::Policy;

/// Backoff schedule for instance rebuild attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total build attempts before the slot is left faulted.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Backoff multiplier applied per failed attempt.
    pub multiplier: u32,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            multiplier: 2,
            jitter: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(factor);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Configuration of one instance pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Replica count R. 1, 2, and >= 3 are the meaningful policy regimes.
    pub replicas: usize,
    /// Per-invocation deadline; an elapsed deadline is treated as a trap.
    pub invoke_timeout: Duration,
    pub rebuild: RetryPolicy,
}

impl PoolConfig {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            invoke_timeout: Duration::from_secs(1),
            rebuild: RetryPolicy::default(),
        }
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_rebuild(mut self, rebuild: RetryPolicy) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn policy(&self) -> Policy {
        Policy::from_replicas(self.replicas)
    }

    pub fn quorum_min(&self) -> usize {
        self.policy().quorum_min()
    }
}
