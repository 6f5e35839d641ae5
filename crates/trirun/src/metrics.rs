//! # Metrics Collector
//!
//! Monotonic counters plus last-observed latency samples describing pool
//! health, vote outcomes, and recovery timing. Mutated only by the
//! dispatcher, voter, and recovery manager; external observers read
//! snapshots.

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::vote::Severity;

#[derive(Default)]
struct Timings {
    instantiate_ms: Option<f64>,
    last_rebuild_ms: Option<f64>,
    last_switchover_ms: Option<f64>,
}

#[derive(Default)]
pub struct PoolMetrics {
    frames_seen: AtomicU64,
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
    traps_observed: AtomicU64,
    invoke_timeouts: AtomicU64,
    votes_unanimous: AtomicU64,
    votes_majority: AtomicU64,
    votes_irreconcilable: AtomicU64,
    failovers: AtomicU64,
    pool_not_ready: AtomicU64,
    recoveries_started: AtomicU64,
    recoveries_completed: AtomicU64,
    recoveries_failed: AtomicU64,
    sink_errors: AtomicU64,
    timings: Mutex<Timings>,
}

/// Point-in-time copy of all metrics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_seen: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub traps_observed: u64,
    pub invoke_timeouts: u64,
    pub votes_unanimous: u64,
    pub votes_majority: u64,
    pub votes_irreconcilable: u64,
    pub failovers: u64,
    pub pool_not_ready: u64,
    pub recoveries_started: u64,
    pub recoveries_completed: u64,
    pub recoveries_failed: u64,
    pub sink_errors: u64,
    pub compile_ms: Option<f64>,
    pub instantiate_ms: Option<f64>,
    pub last_rebuild_ms: Option<f64>,
    pub last_switchover_ms: Option<f64>,
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

impl PoolMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_frames(&self) {
        self.frames_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_traps(&self, count: u64) {
        self.traps_observed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn inc_timeouts(&self) {
        self.invoke_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_pool_not_ready(&self) {
        self.pool_not_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_recoveries_started(&self) {
        self.recoveries_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_recoveries_completed(&self) {
        self.recoveries_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_recoveries_failed(&self) {
        self.recoveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_sink_errors(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_vote(&self, severity: &Severity, accepted: bool) {
        match severity {
            Severity::Unanimous => self.votes_unanimous.fetch_add(1, Ordering::Relaxed),
            Severity::Majority => self.votes_majority.fetch_add(1, Ordering::Relaxed),
            Severity::Irreconcilable => self.votes_irreconcilable.fetch_add(1, Ordering::Relaxed),
        };
        if accepted {
            self.frames_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_instantiate(&self, elapsed: Duration) {
        self.lock_timings().instantiate_ms = Some(ms(elapsed));
    }

    pub(crate) fn record_rebuild(&self, elapsed: Duration) {
        self.lock_timings().last_rebuild_ms = Some(ms(elapsed));
    }

    pub(crate) fn record_switchover(&self, elapsed: Duration) {
        self.lock_timings().last_switchover_ms = Some(ms(elapsed));
    }

    fn lock_timings(&self) -> std::sync::MutexGuard<'_, Timings> {
        self.timings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self, compile: Option<Duration>) -> MetricsSnapshot {
        let timings = self.lock_timings();
        MetricsSnapshot {
            frames_seen: self.frames_seen.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            traps_observed: self.traps_observed.load(Ordering::Relaxed),
            invoke_timeouts: self.invoke_timeouts.load(Ordering::Relaxed),
            votes_unanimous: self.votes_unanimous.load(Ordering::Relaxed),
            votes_majority: self.votes_majority.load(Ordering::Relaxed),
            votes_irreconcilable: self.votes_irreconcilable.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            pool_not_ready: self.pool_not_ready.load(Ordering::Relaxed),
            recoveries_started: self.recoveries_started.load(Ordering::Relaxed),
            recoveries_completed: self.recoveries_completed.load(Ordering::Relaxed),
            recoveries_failed: self.recoveries_failed.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            compile_ms: compile.map(ms),
            instantiate_ms: timings.instantiate_ms,
            last_rebuild_ms: timings.last_rebuild_ms,
            last_switchover_ms: timings.last_switchover_ms,
        }
    }
}
