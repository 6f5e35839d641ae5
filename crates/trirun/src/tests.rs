//! Pool scenario tests driven by scripted invokers and factories.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::config::RetryPolicy;
use crate::dispatch::Dispatcher;
use crate::dispatch::Error;
use crate::invoke::BuildError;
use crate::invoke::BuildResult;
use crate::invoke::InstanceFactory;
use crate::invoke::Invoker;
use crate::invoke::Outcome;
use crate::pool::Health;
use crate::sink::MemorySink;
use crate::sink::Publication;
use crate::sink::Qos;
use crate::source::VecSource;
use crate::vote::Severity;

/// Always returns the same publication list.
struct FixedInvoker {
    publications: Vec<Publication>,
}

#[async_trait::async_trait]
impl Invoker for FixedInvoker {
    async fn invoke(&self, _frame: &[u8]) -> Outcome {
        Outcome::Value(self.publications.clone())
    }
}

/// Always traps.
struct TrapInvoker;

#[async_trait::async_trait]
impl Invoker for TrapInvoker {
    async fn invoke(&self, _frame: &[u8]) -> Outcome {
        Outcome::Trap("wasm trap: unreachable".to_string())
    }
}

/// Hangs longer than any reasonable invoke timeout.
struct SlowInvoker;

#[async_trait::async_trait]
impl Invoker for SlowInvoker {
    async fn invoke(&self, _frame: &[u8]) -> Outcome {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Outcome::Value(Vec::new())
    }
}

/// Hands out pre-scripted build results in order. An exhausted script is a
/// test bug and fails the build loudly.
struct ScriptedFactory {
    script: Mutex<VecDeque<BuildResult<Arc<dyn Invoker>>>>,
    refreshes: AtomicU32,
}

impl ScriptedFactory {
    fn new(script: Vec<BuildResult<Arc<dyn Invoker>>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            refreshes: AtomicU32::new(0),
        }
    }

    fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl InstanceFactory for ScriptedFactory {
    async fn build(&self) -> BuildResult<Arc<dyn Invoker>> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BuildError::Instantiate("factory script exhausted".into())))
    }

    async fn refresh(&self) -> BuildResult<()> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Delegating factory whose builds must be released by the test, so slot
/// health can be observed mid-rebuild.
struct GatedFactory {
    delegate: ScriptedFactory,
    gate: Semaphore,
}

impl GatedFactory {
    fn new(script: Vec<BuildResult<Arc<dyn Invoker>>>, initial_permits: usize) -> Self {
        Self {
            delegate: ScriptedFactory::new(script),
            gate: Semaphore::new(initial_permits),
        }
    }

    fn release(&self, builds: usize) {
        self.gate.add_permits(builds);
    }
}

#[async_trait::async_trait]
impl InstanceFactory for GatedFactory {
    async fn build(&self) -> BuildResult<Arc<dyn Invoker>> {
        self.gate
            .acquire()
            .await
            .expect("gate closed")
            .forget();
        self.delegate.build().await
    }

    async fn refresh(&self) -> BuildResult<()> {
        self.delegate.refresh().await
    }
}

fn publications(tag: &str) -> Vec<Publication> {
    vec![Publication {
        topic: "ics/telemetry/unit-1".to_string(),
        payload: tag.as_bytes().to_vec(),
        qos: Qos::AtMostOnce,
    }]
}

fn value(tag: &str) -> BuildResult<Arc<dyn Invoker>> {
    Ok(Arc::new(FixedInvoker {
        publications: publications(tag),
    }))
}

fn trap() -> BuildResult<Arc<dyn Invoker>> {
    Ok(Arc::new(TrapInvoker))
}

fn build_error() -> BuildResult<Arc<dyn Invoker>> {
    Err(BuildError::Instantiate("out of fuel".into()))
}

fn fast_rebuild() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        multiplier: 2,
        jitter: Duration::ZERO,
    }
}

fn tmr_config() -> PoolConfig {
    PoolConfig::new(3).with_rebuild(fast_rebuild())
}

/// A deliberately truncated 3-byte MBAP header, shorter than the minimum.
const TRUNCATED_HEADER: &[u8] = &[0x00, 0x01, 0x00];

#[tokio::test]
async fn test_unanimous_agreement() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let report = pool.process_frame(TRUNCATED_HEADER).await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.severity, Severity::Unanimous);
    assert_eq!(report.agreement, "3/3");
    assert!(report.faulty_instances.is_empty());
    assert_eq!(report.result, Some(publications("a")));

    let metrics = pool.metrics();
    assert_eq!(metrics.frames_seen, 1);
    assert_eq!(metrics.votes_unanimous, 1);
    assert_eq!(metrics.recoveries_started, 0);
}

#[tokio::test]
async fn test_truncated_header_rejected_identically_by_all() {
    // A well-behaved parser returns an identical "invalid frame" outcome
    // (no publications) in every instance, so the vote is unanimous and no
    // instance is suspected.
    let factory = Arc::new(ScriptedFactory::new(vec![
        Ok(Arc::new(FixedInvoker { publications: Vec::new() }) as Arc<dyn Invoker>),
        Ok(Arc::new(FixedInvoker { publications: Vec::new() }) as Arc<dyn Invoker>),
        Ok(Arc::new(FixedInvoker { publications: Vec::new() }) as Arc<dyn Invoker>),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let report = pool.process_frame(TRUNCATED_HEADER).await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.severity, Severity::Unanimous);
    assert!(report.faulty_instances.is_empty());
    assert_eq!(report.result, Some(Vec::new()));
}

#[tokio::test]
async fn test_divergent_instance_outvoted_and_rebuilt() {
    let factory = Arc::new(GatedFactory::new(
        vec![value("good"), value("good"), value("stale"), value("good")],
        3,
    ));
    let pool = Dispatcher::new(factory.clone(), tmr_config()).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.severity, Severity::Majority);
    assert_eq!(report.agreement, "2/3");
    assert_eq!(report.faulty_instances, vec![2]);
    assert_eq!(report.result, Some(publications("good")));

    // The rebuild is scheduled but gated: the slot is observably rebuilding.
    assert_eq!(pool.health().await[2], Health::Rebuilding);

    factory.release(1);
    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await, vec![Health::Healthy; 3]);
    assert_eq!(pool.pool().generation(2).await, Some(1));

    // With the fresh instance installed the pool is unanimous again.
    let report = pool.process_frame(b"frame").await.unwrap();
    assert_eq!(report.severity, Severity::Unanimous);

    let metrics = pool.metrics();
    assert_eq!(metrics.recoveries_started, 1);
    assert_eq!(metrics.recoveries_completed, 1);
    assert!(metrics.last_rebuild_ms.is_some());
}

#[tokio::test]
async fn test_trap_outvoted_by_majority() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        trap(),
        value("a"),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.severity, Severity::Majority);
    assert_eq!(report.faulty_instances, vec![1]);

    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await, vec![Health::Healthy; 3]);
    assert_eq!(pool.metrics().traps_observed, 1);
}

#[tokio::test]
async fn test_irreconcilable_when_all_differ() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("b"),
        value("c"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(!report.accepted);
    assert_eq!(report.severity, Severity::Irreconcilable);
    assert_eq!(report.agreement, "1/3");
    assert!(report.result.is_none());
    // No majority to measure dissent against: nobody is rebuilt.
    assert!(report.faulty_instances.is_empty());
    assert_eq!(pool.metrics().recoveries_started, 0);
}

#[tokio::test]
async fn test_trap_plurality_is_irreconcilable() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        trap(),
        value("a"),
        trap(),
        value("a"),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(!report.accepted);
    assert_eq!(report.severity, Severity::Irreconcilable);
    assert_eq!(report.faulty_instances, vec![0, 2]);

    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await, vec![Health::Healthy; 3]);
}

#[tokio::test]
async fn test_single_replica_trap_fails_frame_and_rebuilds() {
    let factory = Arc::new(ScriptedFactory::new(vec![trap(), value("a")]));
    let config = PoolConfig::new(1).with_rebuild(fast_rebuild());
    let pool = Dispatcher::new(factory, config).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(!report.accepted);
    assert_eq!(report.agreement, "0/1");
    assert_eq!(report.faulty_instances, vec![0]);

    pool.await_recovery_idle().await;
    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.agreement, "1/1");
}

#[tokio::test]
async fn test_hot_standby_failover_within_one_call() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        trap(),
        value("standby"),
        value("fresh"),
    ]));
    let config = PoolConfig::new(2).with_rebuild(fast_rebuild());
    let pool = Dispatcher::new(factory, config).await.unwrap();
    assert_eq!(pool.pool().active_index(), 0);

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(!report.accepted, "failed frame is reported, not retried");
    assert_eq!(report.failover, Some(1));
    assert_eq!(report.faulty_instances, vec![0]);
    assert_eq!(pool.pool().active_index(), 1);

    let metrics = pool.metrics();
    assert_eq!(metrics.failovers, 1);
    assert!(metrics.last_switchover_ms.is_some());

    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await, vec![Health::Healthy; 2]);

    // Subsequent frames run on the promoted standby alone.
    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.agreement, "1/1");
    assert_eq!(report.result, Some(publications("standby")));
}

#[tokio::test]
async fn test_quorum_starved_pool_not_ready() {
    // All three instances trap and every rebuild attempt fails, so the pool
    // ends up quorum-starved.
    let rebuild = RetryPolicy {
        max_attempts: 1,
        ..fast_rebuild()
    };
    let factory = Arc::new(ScriptedFactory::new(vec![
        trap(),
        trap(),
        trap(),
        build_error(),
        build_error(),
        build_error(),
    ]));
    let pool = Dispatcher::new(factory, PoolConfig::new(3).with_rebuild(rebuild))
        .await
        .unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert_eq!(report.severity, Severity::Irreconcilable);

    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await, vec![Health::Faulted; 3]);
    assert_eq!(pool.metrics().recoveries_failed, 3);

    match pool.process_frame(b"frame").await {
        Err(Error::PoolNotReady { healthy, required }) => {
            assert_eq!(healthy, 0);
            assert_eq!(required, 2);
        }
        other => panic!("Expected PoolNotReady, got {:?}", other.map(|r| r.agreement)),
    }
    assert_eq!(pool.metrics().pool_not_ready, 1);
}

#[tokio::test]
async fn test_hung_invocation_treated_as_trap() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        Ok(Arc::new(SlowInvoker) as Arc<dyn Invoker>),
        value("a"),
    ]));
    let config = tmr_config().with_invoke_timeout(Duration::from_millis(10));
    let pool = Dispatcher::new(factory, config).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.severity, Severity::Majority);
    assert_eq!(report.faulty_instances, vec![2]);
    assert_eq!(pool.metrics().invoke_timeouts, 1);

    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await, vec![Health::Healthy; 3]);
}

#[tokio::test]
async fn test_degraded_pool_still_reaches_quorum() {
    let factory = Arc::new(GatedFactory::new(
        vec![value("a"), value("a"), trap(), value("a")],
        3,
    ));
    let pool = Dispatcher::new(factory.clone(), tmr_config()).await.unwrap();

    let report = pool.process_frame(b"frame").await.unwrap();
    assert_eq!(report.faulty_instances, vec![2]);
    assert_eq!(pool.health().await[2], Health::Rebuilding);

    // Two healthy slots still clear the 2-of-3 threshold, but unanimity over
    // all configured replicas is out of reach while one slot rebuilds.
    let report = pool.process_frame(b"frame").await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.severity, Severity::Majority);
    assert_eq!(report.agreement, "2/2");

    factory.release(1);
    pool.await_recovery_idle().await;
    let report = pool.process_frame(b"frame").await.unwrap();
    assert_eq!(report.severity, Severity::Unanimous);
    assert_eq!(report.agreement, "3/3");
}

#[tokio::test]
async fn test_reload_is_idempotent_for_unchanged_artifact() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        value("a"),
        value("a"),
        value("a"),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory.clone(), tmr_config()).await.unwrap();

    let before = pool.process_frame(b"frame").await.unwrap();
    pool.reload(None).await.unwrap();
    assert_eq!(factory.refreshes(), 1);

    let after = pool.process_frame(b"frame").await.unwrap();
    assert_eq!(after.severity, before.severity);
    assert_eq!(after.agreement, before.agreement);
    assert_eq!(after.result, before.result);
    assert_eq!(pool.pool().generation(0).await, Some(1));
}

#[tokio::test]
async fn test_recovery_retries_then_succeeds() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        trap(),
        build_error(),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    pool.process_frame(b"frame").await.unwrap();
    pool.await_recovery_idle().await;

    assert_eq!(pool.health().await, vec![Health::Healthy; 3]);
    let metrics = pool.metrics();
    assert_eq!(metrics.recoveries_started, 1);
    assert_eq!(metrics.recoveries_completed, 1);
    assert_eq!(metrics.recoveries_failed, 0);
}

#[tokio::test]
async fn test_exhausted_recovery_leaves_slot_faulted_until_reload() {
    let rebuild = RetryPolicy {
        max_attempts: 2,
        ..fast_rebuild()
    };
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        trap(),
        build_error(),
        build_error(),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, PoolConfig::new(3).with_rebuild(rebuild))
        .await
        .unwrap();

    pool.process_frame(b"frame").await.unwrap();
    pool.await_recovery_idle().await;
    assert_eq!(pool.health().await[2], Health::Faulted);
    assert_eq!(pool.metrics().recoveries_failed, 1);

    // Manual reload of the slot brings it back.
    pool.reload(Some(2)).await.unwrap();
    assert_eq!(pool.health().await[2], Health::Healthy);
    let report = pool.process_frame(b"frame").await.unwrap();
    assert_eq!(report.severity, Severity::Unanimous);
}

#[tokio::test]
async fn test_only_winning_result_reaches_sink_once() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("good"),
        value("good"),
        value("stale"),
        value("good"),
    ]));
    let sink = Arc::new(MemorySink::new());
    let pool = Dispatcher::with_sink(factory, sink.clone(), tmr_config())
        .await
        .unwrap();

    pool.process_frame(b"frame").await.unwrap();
    assert_eq!(sink.published(), publications("good"));
}

#[tokio::test]
async fn test_rejected_frame_publishes_nothing() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("b"),
        value("c"),
    ]));
    let sink = Arc::new(MemorySink::new());
    let pool = Dispatcher::with_sink(factory, sink.clone(), tmr_config())
        .await
        .unwrap();

    pool.process_frame(b"frame").await.unwrap();
    assert!(sink.published().is_empty());
}

#[tokio::test]
async fn test_overlapping_process_calls() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let (first, second) = tokio::join!(
        pool.process_frame(b"frame-1"),
        pool.process_frame(b"frame-2"),
    );
    assert!(first.unwrap().accepted);
    assert!(second.unwrap().accepted);
    assert_eq!(pool.metrics().frames_seen, 2);
}

#[tokio::test]
async fn test_ingest_pump_drains_source() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        value("a"),
        value("a"),
        value("a"),
    ]));
    let pool = Dispatcher::new(factory, tmr_config()).await.unwrap();

    let source = Arc::new(VecSource::new(vec![
        vec![0x00, 0x01],
        vec![0x00, 0x02],
        vec![0x00, 0x03],
    ]));
    let summary = pool.run_ingest(source).await;
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.accepted, 3);
    assert_eq!(summary.rejected, 0);
}

#[tokio::test]
async fn test_zero_replicas_rejected() {
    let factory = Arc::new(ScriptedFactory::new(Vec::new()));
    match Dispatcher::new(factory, PoolConfig::new(0)).await {
        Err(Error::Config(_)) => {}
        other => panic!("Expected Config error, got {:?}", other.map(|_| ())),
    }
}
