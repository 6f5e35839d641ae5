//! # Recovery Manager
//!
//! Rebuilds faulty slots in the background. Recovery tasks are spawned and
//! never awaited by the request path: the dispatcher returns its vote result
//! while rebuilds proceed, and recoveries of different slots run concurrently
//! with each other and with ongoing frame processing.
//!
//! A failed rebuild never vanishes silently; every terminal state lands in
//! the metrics and the log.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::config::RetryPolicy;
use crate::invoke::InstanceFactory;
use crate::metrics::PoolMetrics;
use crate::pool::Health;
use crate::pool::InstancePool;

#[derive(Clone)]
pub struct RecoveryManager {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Arc<InstancePool>,
    factory: Arc<dyn InstanceFactory>,
    metrics: Arc<PoolMetrics>,
    policy: RetryPolicy,
    /// Slot index -> rebuild start. At most one in-flight recovery per slot.
    in_flight: DashMap<usize, Instant>,
    epoch: watch::Sender<u64>,
}

impl RecoveryManager {
    pub(crate) fn new(
        pool: Arc<InstancePool>,
        factory: Arc<dyn InstanceFactory>,
        metrics: Arc<PoolMetrics>,
        policy: RetryPolicy,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                pool,
                factory,
                metrics,
                policy,
                in_flight: DashMap::new(),
                epoch,
            }),
        }
    }

    /// Schedules a background rebuild of `index`. Idempotent while a rebuild
    /// for that slot is already in flight. Marks the slot `Rebuilding` before
    /// returning so callers observe the transition immediately.
    pub async fn schedule(&self, index: usize) {
        match self.inner.in_flight.entry(index) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }
        self.inner.metrics.inc_recoveries_started();
        self.inner.pool.set_health(index, Health::Rebuilding).await;
        tracing::info!(index, "scheduling instance rebuild");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(index).await;
        });
    }

    async fn run(&self, index: usize) {
        let started = self
            .inner
            .in_flight
            .get(&index)
            .map(|entry| *entry.value())
            .unwrap_or_else(Instant::now);

        let mut attempt = 1;
        let outcome = loop {
            match self.inner.factory.build().await {
                Ok(invoker) => break Ok(invoker),
                Err(error) => {
                    if attempt >= self.inner.policy.max_attempts {
                        break Err(error);
                    }
                    tracing::warn!(index, attempt, %error, "instance rebuild failed, backing off");
                    tokio::time::sleep(self.inner.policy.delay(attempt)).await;
                    attempt += 1;
                }
            }
        };

        match outcome {
            Ok(invoker) => {
                self.inner.pool.replace(index, invoker).await;
                self.inner.metrics.record_rebuild(started.elapsed());
                self.inner.metrics.inc_recoveries_completed();
                tracing::info!(
                    index,
                    rebuild_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "slot rebuilt"
                );
            }
            Err(error) => {
                self.inner.pool.set_health(index, Health::Faulted).await;
                self.inner.metrics.inc_recoveries_failed();
                tracing::error!(index, %error, "rebuild retries exhausted, slot left faulted");
            }
        }

        self.inner.in_flight.remove(&index);
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Number of rebuilds currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Waits until no recoveries are in flight. Intended for tests and
    /// shutdown paths; the request path never calls this.
    pub async fn await_idle(&self) {
        let mut rx = self.inner.epoch.subscribe();
        while !self.inner.in_flight.is_empty() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}
