//! # Dispatcher
//!
//! The outward surface of the pool. For each frame it snapshots the healthy
//! slots, invokes them concurrently with the identical input, waits for the
//! full outcome set (majority voting needs every outcome, so there is no
//! partial-result short-circuiting), hands the set to the voter, forwards
//! faulty indices to the recovery manager fire-and-forget, and returns the
//! vote's result.
//!
//! A fault confined to a single instance never becomes a fault visible to the
//! process hosting the pool; only irreconcilable or quorum-starved conditions
//! surface, and those are reported as data.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use crate::config::PoolConfig;
use crate::invoke::BuildError;
use crate::invoke::GuestStats;
use crate::invoke::InstanceFactory;
use crate::invoke::Invoker;
use crate::invoke::Outcome;
use crate::metrics::MetricsSnapshot;
use crate::metrics::PoolMetrics;
use crate::pool::Health;
use crate::pool::InstancePool;
use crate::recover::RecoveryManager;
use crate::sink::FrameSink;
use crate::sink::NullSink;
use crate::sink::Publication;
use crate::source::FrameSource;
use crate::vote;
use crate::vote::Policy;
use crate::vote::Severity;

#[derive(Debug)]
pub enum Error {
    /// Fewer healthy instances than the quorum minimum. Transient; resolves
    /// once recovery finishes or after a reload.
    PoolNotReady { healthy: usize, required: usize },
    InvalidSlot(usize),
    Config(String),
    Build(BuildError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolNotReady { healthy, required } => write!(
                f,
                "Pool not ready: {} healthy instances, quorum requires {}",
                healthy, required
            ),
            Self::InvalidSlot(index) => write!(f, "No slot at index {}", index),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Build(e) => write!(f, "Build error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<BuildError> for Error {
    fn from(e: BuildError) -> Self {
        Self::Build(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What one `process_frame` call decided.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub accepted: bool,
    pub severity: Severity,
    /// Agreement ratio over the instances invoked, e.g. "2/3".
    pub agreement: String,
    pub faulty_instances: Vec<usize>,
    /// New active slot, set when a hot-standby failover happened in this call.
    pub failover: Option<usize>,
    /// The accepted publication list, absent on rejection.
    pub result: Option<Vec<Publication>>,
}

/// Totals from one ingest pump run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub frames: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// The redundant execution pool's supervisor-facing handle. Cheap to clone;
/// safe for overlapping concurrent `process_frame` calls.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Arc<InstancePool>,
    factory: Arc<dyn InstanceFactory>,
    sink: Arc<dyn FrameSink>,
    config: PoolConfig,
    policy: Policy,
    metrics: Arc<PoolMetrics>,
    recovery: RecoveryManager,
}

impl Dispatcher {
    /// Builds a pool of `config.replicas` instances with output discarded.
    pub async fn new(factory: Arc<dyn InstanceFactory>, config: PoolConfig) -> Result<Self> {
        Self::with_sink(factory, Arc::new(NullSink), config).await
    }

    /// Builds a pool that forwards accepted publications to `sink`.
    pub async fn with_sink(
        factory: Arc<dyn InstanceFactory>,
        sink: Arc<dyn FrameSink>,
        config: PoolConfig,
    ) -> Result<Self> {
        if config.replicas == 0 {
            return Err(Error::Config("replica count must be at least 1".into()));
        }

        let metrics = Arc::new(PoolMetrics::new());
        let started = Instant::now();
        let mut invokers: Vec<Arc<dyn Invoker>> = Vec::with_capacity(config.replicas);
        for _ in 0..config.replicas {
            invokers.push(factory.build().await?);
        }
        metrics.record_instantiate(started.elapsed() / config.replicas as u32);

        let policy = config.policy();
        let pool = Arc::new(InstancePool::new(invokers));
        let recovery = RecoveryManager::new(
            pool.clone(),
            factory.clone(),
            metrics.clone(),
            config.rebuild.clone(),
        );
        tracing::info!(replicas = config.replicas, ?policy, "instance pool initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                factory,
                sink,
                config,
                policy,
                metrics,
                recovery,
            }),
        })
    }

    /// Processes one frame through the pool.
    ///
    /// Fails only with `PoolNotReady`; every sandbox-level fault is absorbed
    /// into the returned report.
    pub async fn process_frame(&self, frame: &[u8]) -> Result<FrameReport> {
        let inner = &self.inner;

        let healthy = inner.pool.snapshot_active().await;
        let required = inner.config.quorum_min();
        if healthy.len() < required {
            inner.metrics.inc_pool_not_ready();
            return Err(Error::PoolNotReady {
                healthy: healthy.len(),
                required,
            });
        }

        let participants = match inner.policy {
            Policy::HotStandby => match inner.pool.snapshot_hot().await {
                Some(hot) => vec![hot],
                None => {
                    inner.metrics.inc_pool_not_ready();
                    return Err(Error::PoolNotReady {
                        healthy: 0,
                        required,
                    });
                }
            },
            _ => healthy,
        };

        inner.metrics.inc_frames();
        let outcomes = self.fan_out(&participants, frame).await;
        let trapped = outcomes.iter().filter(|(_, o)| o.is_trap()).count() as u64;
        if trapped > 0 {
            inner.metrics.inc_traps(trapped);
        }

        let vote = vote::reconcile(&inner.policy, &outcomes);
        inner.metrics.record_vote(&vote.severity, vote.accepted.is_some());
        tracing::debug!(
            severity = ?vote.severity,
            agreement = %vote.agreement,
            faulty = ?vote.faulty,
            "frame reconciled"
        );

        for &index in &vote.faulty {
            inner.pool.mark_faulty(index).await;
        }

        let mut failover = None;
        if inner.policy == Policy::HotStandby && !vote.faulty.is_empty() {
            let switch_started = Instant::now();
            failover = inner.pool.fail_over(vote.faulty[0]).await;
            if let Some(promoted) = failover {
                inner.metrics.record_switchover(switch_started.elapsed());
                inner.metrics.inc_failovers();
                tracing::warn!(
                    trapped = vote.faulty[0],
                    promoted,
                    "hot-standby failover"
                );
            }
        }

        // Fire-and-forget: the rebuilds run behind this call's back.
        for &index in &vote.faulty {
            inner.recovery.schedule(index).await;
        }

        if let Some(publications) = &vote.accepted {
            self.forward(publications).await;
        }

        Ok(FrameReport {
            accepted: vote.accepted.is_some(),
            severity: vote.severity,
            agreement: vote.agreement,
            faulty_instances: vote.faulty,
            failover,
            result: vote.accepted,
        })
    }

    /// Invokes every participant with the identical frame, concurrently, and
    /// waits for the full set. A hung invocation is cut off at the configured
    /// timeout and treated as a trap.
    async fn fan_out(
        &self,
        participants: &[(usize, Arc<dyn Invoker>)],
        frame: &[u8],
    ) -> Vec<(usize, Outcome)> {
        let timeout = self.inner.config.invoke_timeout;
        let futures = participants.iter().map(|(index, invoker)| {
            let index = *index;
            let invoker = invoker.clone();
            let metrics = self.inner.metrics.clone();
            async move {
                match tokio::time::timeout(timeout, invoker.invoke(frame)).await {
                    Ok(outcome) => (index, outcome),
                    Err(_) => {
                        metrics.inc_timeouts();
                        tracing::warn!(index, ?timeout, "invocation timed out");
                        (index, Outcome::Trap("invocation timed out".to_string()))
                    }
                }
            }
        });
        join_all(futures).await
    }

    async fn forward(&self, publications: &[Publication]) {
        for publication in publications {
            if let Err(error) = self.inner.sink.publish(publication).await {
                self.inner.metrics.inc_sink_errors();
                tracing::warn!(topic = %publication.topic, %error, "sink publish failed");
            }
        }
    }

    /// Rebuilds one slot, or recompiles the artifact and rebuilds every slot.
    ///
    /// Runs inline (unlike fault recovery) so callers can sequence work after
    /// it. In-flight frames that captured the old artifact are unaffected.
    pub async fn reload(&self, index: Option<usize>) -> Result<()> {
        let inner = &self.inner;
        match index {
            None => {
                inner.factory.refresh().await?;
                for slot in 0..inner.pool.len() {
                    let invoker = inner.factory.build().await?;
                    inner.pool.replace(slot, invoker).await;
                }
                tracing::info!("full pool reload complete");
            }
            Some(slot) => {
                if slot >= inner.pool.len() {
                    return Err(Error::InvalidSlot(slot));
                }
                let invoker = inner.factory.build().await?;
                inner.pool.replace(slot, invoker).await;
                tracing::info!(slot, "slot reloaded");
            }
        }
        Ok(())
    }

    /// Pulls frames from `source` until exhaustion, processing each.
    ///
    /// Quorum starvation skips the frame rather than aborting the pump; the
    /// frame counts as rejected.
    pub async fn run_ingest(&self, source: Arc<dyn FrameSource>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        loop {
            let frame = match source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(%error, "frame source failed, stopping ingest");
                    break;
                }
            };
            summary.frames += 1;
            match self.process_frame(&frame).await {
                Ok(report) if report.accepted => summary.accepted += 1,
                Ok(_) => summary.rejected += 1,
                Err(error) => {
                    summary.rejected += 1;
                    tracing::warn!(%error, "frame skipped");
                }
            }
        }
        summary
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.factory.compile_time())
    }

    pub async fn health(&self) -> Vec<Health> {
        self.inner.pool.health_all().await
    }

    /// Polls one healthy instance's guest-exported counters.
    pub async fn guest_stats(&self, index: usize) -> Option<GuestStats> {
        let invoker = self.inner.pool.probe(index).await?;
        invoker.stats().await
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.inner.pool
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.inner.recovery
    }

    /// Waits for all in-flight recoveries. Test and shutdown helper.
    pub async fn await_recovery_idle(&self) {
        self.inner.recovery.await_idle().await;
    }
}
