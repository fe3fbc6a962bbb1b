//! Integration tests for the job scheduler: priority ordering, retry and
//! backoff, cancellation, capacity, timeouts, and stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use omnishot_dispatch::config::SchedulerConfig;
use omnishot_dispatch::core::{
    DispatchError, ExecutionError, ExecutorRegistry, JobContext, JobExecutor, JobId, JobKind,
    JobPayload, JobScheduler, JobStatus, JobStatusView, Priority,
};
use omnishot_dispatch::infra::store::InMemoryJobStore;
use omnishot_dispatch::util::SystemClock;

fn headshot_payload(user: &str) -> JobPayload {
    JobPayload::GenerateHeadshot {
        user_id: user.into(),
        source_key: format!("uploads/{user}/raw.png"),
        style: "corporate".into(),
    }
}

fn export_payload(user: &str) -> JobPayload {
    JobPayload::ExportBatch {
        user_id: user.into(),
        image_keys: vec![format!("finished/{user}/1.png")],
        format: "zip".into(),
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent: 1,
        max_queue_size: 100,
        default_max_attempts: 3,
        backoff_ms: vec![20, 40],
        default_timeout_secs: 5,
        tick_interval_ms: 20,
        retention_secs: 3_600,
        cleanup_interval_ms: 60_000,
        ..SchedulerConfig::default()
    }
}

/// Executor that records completion order and sleeps briefly per job.
#[derive(Clone)]
struct OrderedExecutor {
    order: Arc<Mutex<Vec<JobId>>>,
    hold_ms: u64,
}

impl OrderedExecutor {
    fn new(hold_ms: u64) -> Self {
        Self {
            order: Arc::new(Mutex::new(Vec::new())),
            hold_ms,
        }
    }

    fn order(&self) -> Vec<JobId> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl JobExecutor for OrderedExecutor {
    async fn execute(
        &self,
        _payload: JobPayload,
        ctx: JobContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        tokio::time::sleep(Duration::from_millis(self.hold_ms)).await;
        self.order.lock().push(ctx.job_id);
        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Executor that fails transiently until a given attempt number succeeds.
#[derive(Clone)]
struct FlakyExecutor {
    succeed_on_attempt: u32,
}

#[async_trait]
impl JobExecutor for FlakyExecutor {
    async fn execute(
        &self,
        _payload: JobPayload,
        ctx: JobContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        if ctx.attempt < self.succeed_on_attempt {
            Err(ExecutionError::Transient(format!(
                "upstream 503 on attempt {}",
                ctx.attempt
            )))
        } else {
            Ok(serde_json::json!({ "attempt": ctx.attempt }))
        }
    }
}

/// Executor that tracks its own concurrency high-water mark.
#[derive(Clone)]
struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    fn new() -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for ConcurrencyProbe {
    async fn execute(
        &self,
        _payload: JobPayload,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

/// Executor that polls its cancellation token while "working".
#[derive(Clone)]
struct CancellableExecutor;

#[async_trait]
impl JobExecutor for CancellableExecutor {
    async fn execute(
        &self,
        _payload: JobPayload,
        ctx: JobContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        for step in 0..100u8 {
            if ctx.cancel.is_cancelled() {
                return Err(ExecutionError::Permanent("cancelled by caller".into()));
            }
            ctx.progress.report(step);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(serde_json::Value::Null)
    }
}

fn registry_for(kind: JobKind, executor: Arc<dyn JobExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(kind, executor);
    registry
}

fn scheduler_with(config: SchedulerConfig, registry: ExecutorRegistry) -> JobScheduler {
    JobScheduler::new(
        config,
        Arc::new(InMemoryJobStore::new()),
        registry,
        Arc::new(SystemClock::new()),
    )
}

async fn wait_for_terminal(
    scheduler: &JobScheduler,
    id: JobId,
    timeout: Duration,
) -> JobStatusView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = scheduler.job_status(id).expect("job should exist");
        if view.status.is_terminal() {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {:?}",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_job_completes_with_result() {
    let executor = OrderedExecutor::new(5);
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(executor)),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-1"), None, None)
        .await
        .unwrap();

    let view = wait_for_terminal(&scheduler, id, Duration::from_secs(5)).await;
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.attempts, 1);
    assert_eq!(view.progress, Some(100));
    assert_eq!(view.result.unwrap()["ok"], true);

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_urgent_runs_before_earlier_standard_jobs() {
    // One worker slot; a blocker occupies it while we queue three standard
    // jobs and then an urgent one
    let executor = OrderedExecutor::new(20);
    let shared = executor.clone();
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(executor)),
    );
    let handle = scheduler.start();

    let blocker = scheduler
        .add_job(headshot_payload("blocker"), None, None)
        .await
        .unwrap();
    {
        let scheduler = scheduler.clone();
        wait_until(
            move || scheduler.queue_stats().processing == 1,
            Duration::from_secs(2),
            "blocker to start",
        )
        .await;
    }

    let standard: Vec<JobId> = {
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                scheduler
                    .add_job(headshot_payload(&format!("std-{i}")), None, None)
                    .await
                    .unwrap(),
            );
        }
        ids
    };
    let urgent = scheduler
        .add_job(headshot_payload("vip"), Some(Priority::Urgent), None)
        .await
        .unwrap();

    for id in standard.iter().chain([&urgent, &blocker]) {
        let view = wait_for_terminal(&scheduler, *id, Duration::from_secs(5)).await;
        assert_eq!(view.status, JobStatus::Completed);
    }

    let order = shared.order();
    assert_eq!(order[0], blocker);
    assert_eq!(order[1], urgent, "urgent must preempt queued standard jobs");
    assert_eq!(&order[2..], &standard[..], "FIFO within the standard lane");

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    // Fails on attempts 1 and 2, succeeds on attempt 3 with max_attempts=3
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(
            JobKind::GenerateHeadshot,
            Arc::new(FlakyExecutor { succeed_on_attempt: 3 }),
        ),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-2"), None, Some(3))
        .await
        .unwrap();

    let view = wait_for_terminal(&scheduler, id, Duration::from_secs(5)).await;
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.attempts, 3);
    assert_eq!(view.result.unwrap()["attempt"], 3);

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_fail_terminally() {
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(
            JobKind::GenerateHeadshot,
            Arc::new(FlakyExecutor { succeed_on_attempt: 99 }),
        ),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-3"), None, Some(2))
        .await
        .unwrap();

    let view = wait_for_terminal(&scheduler, id, Duration::from_secs(5)).await;
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.attempts, 2);
    let error = view.last_error.unwrap();
    assert!(error.contains("attempt 2"), "last error should be reported: {error}");

    scheduler.shutdown();
    handle.await.unwrap();
}

/// Executor that always fails permanently.
#[derive(Clone)]
struct DoomedExecutor;

#[async_trait]
impl JobExecutor for DoomedExecutor {
    async fn execute(
        &self,
        _payload: JobPayload,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        Err(ExecutionError::Permanent("unsupported style preset".into()))
    }
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(DoomedExecutor)),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-4"), None, Some(3))
        .await
        .unwrap();

    let view = wait_for_terminal(&scheduler, id, Duration::from_secs(5)).await;
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.attempts, 1, "permanent errors must not retry");

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_validation_rejected_before_anything_happens() {
    let store = Arc::new(InMemoryJobStore::new());
    let scheduler = JobScheduler::new(
        fast_config(),
        Arc::clone(&store) as Arc<dyn omnishot_dispatch::core::JobStore>,
        registry_for(JobKind::GenerateHeadshot, Arc::new(OrderedExecutor::new(1))),
        Arc::new(SystemClock::new()),
    );

    let bad = JobPayload::GenerateHeadshot {
        user_id: String::new(),
        source_key: "uploads/x.png".into(),
        style: "corporate".into(),
    };
    let err = scheduler.add_job(bad, None, None).await.unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));
    assert!(store.is_empty(), "validation failures persist nothing");

    // A payload type with no registered executor is rejected up front too
    let err = scheduler
        .add_job(export_payload("u-5"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownJobType(_)));
}

#[tokio::test]
async fn test_queue_full_persists_nothing() {
    let store = Arc::new(InMemoryJobStore::new());
    let config = SchedulerConfig {
        max_queue_size: 2,
        ..fast_config()
    };
    let scheduler = JobScheduler::new(
        config,
        Arc::clone(&store) as Arc<dyn omnishot_dispatch::core::JobStore>,
        registry_for(JobKind::GenerateHeadshot, Arc::new(OrderedExecutor::new(1))),
        Arc::new(SystemClock::new()),
    );
    // Loop not started: both jobs stay queued

    scheduler
        .add_job(headshot_payload("u-6"), None, None)
        .await
        .unwrap();
    scheduler
        .add_job(headshot_payload("u-7"), None, None)
        .await
        .unwrap();

    let err = scheduler
        .add_job(headshot_payload("u-8"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::QueueFull { queued: 2, capacity: 2 }
    ));
    assert_eq!(store.len(), 2, "the rejected job must not be persisted");
}

#[tokio::test]
async fn test_concurrency_ceiling_is_respected() {
    let probe = ConcurrencyProbe::new();
    let config = SchedulerConfig {
        max_concurrent: 3,
        ..fast_config()
    };
    let scheduler = scheduler_with(
        config,
        registry_for(JobKind::GenerateHeadshot, Arc::new(probe.clone())),
    );
    let handle = scheduler.start();

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(
            scheduler
                .add_job(headshot_payload(&format!("u-{i}")), None, None)
                .await
                .unwrap(),
        );
    }
    for id in ids {
        wait_for_terminal(&scheduler, id, Duration::from_secs(10)).await;
    }

    assert!(
        probe.peak() <= 3,
        "observed {} concurrent executions with a ceiling of 3",
        probe.peak()
    );

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let executor = OrderedExecutor::new(30);
    let shared = executor.clone();
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(executor)),
    );
    let handle = scheduler.start();

    let blocker = scheduler
        .add_job(headshot_payload("blocker"), None, None)
        .await
        .unwrap();
    {
        let scheduler = scheduler.clone();
        wait_until(
            move || scheduler.queue_stats().processing == 1,
            Duration::from_secs(2),
            "blocker to start",
        )
        .await;
    }

    let victim = scheduler
        .add_job(headshot_payload("victim"), None, None)
        .await
        .unwrap();
    scheduler.cancel_job(victim).await.unwrap();

    let view = scheduler.job_status(victim).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);

    wait_for_terminal(&scheduler, blocker, Duration::from_secs(5)).await;
    // Give the loop a chance to (incorrectly) pick the victim up
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !shared.order().contains(&victim),
        "cancelled queued job must never execute"
    );

    // Terminal jobs cannot be cancelled again
    let err = scheduler.cancel_job(victim).await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyTerminal { .. }));

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_processing_job_is_cooperative() {
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(CancellableExecutor)),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-9"), None, None)
        .await
        .unwrap();
    {
        let scheduler = scheduler.clone();
        wait_until(
            move || scheduler.queue_stats().processing == 1,
            Duration::from_secs(2),
            "job to start",
        )
        .await;
    }

    scheduler.cancel_job(id).await.unwrap();
    let view = scheduler.job_status(id).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);

    // The executor observes the token and the slot frees without the
    // cancellation being overwritten by the settling attempt
    {
        let scheduler = scheduler.clone();
        wait_until(
            move || scheduler.queue_stats().processing == 0,
            Duration::from_secs(5),
            "slot to free",
        )
        .await;
    }
    assert_eq!(scheduler.job_status(id).unwrap().status, JobStatus::Cancelled);

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_job_errors() {
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(OrderedExecutor::new(1))),
    );
    let err = scheduler.cancel_job(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, DispatchError::JobNotFound(_)));
}

#[tokio::test]
async fn test_execution_timeout_is_retryable() {
    /// Sleeps far past the configured timeout.
    #[derive(Clone)]
    struct StuckExecutor;

    #[async_trait]
    impl JobExecutor for StuckExecutor {
        async fn execute(
            &self,
            _payload: JobPayload,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, ExecutionError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    let config = SchedulerConfig {
        default_timeout_secs: 1,
        ..fast_config()
    };
    let scheduler = scheduler_with(
        config,
        registry_for(JobKind::GenerateHeadshot, Arc::new(StuckExecutor)),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-10"), None, Some(1))
        .await
        .unwrap();

    let view = wait_for_terminal(&scheduler, id, Duration::from_secs(10)).await;
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.last_error.unwrap().contains("timed out"));

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_queue_stats_snapshot() {
    let executor = OrderedExecutor::new(40);
    let scheduler = scheduler_with(
        fast_config(),
        registry_for(JobKind::GenerateHeadshot, Arc::new(executor)),
    );
    let handle = scheduler.start();

    let first = scheduler
        .add_job(headshot_payload("u-11"), None, None)
        .await
        .unwrap();
    {
        let scheduler = scheduler.clone();
        wait_until(
            move || scheduler.queue_stats().processing == 1,
            Duration::from_secs(2),
            "first job to start",
        )
        .await;
    }
    scheduler
        .add_job(headshot_payload("u-12"), Some(Priority::Low), None)
        .await
        .unwrap();
    let urgent = scheduler
        .add_job(headshot_payload("u-13"), Some(Priority::Urgent), None)
        .await
        .unwrap();

    let stats = scheduler.queue_stats();
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.queued_by_priority.urgent, 1);
    assert_eq!(stats.queued_by_priority.low, 1);
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.capacity_utilization_percent, 100);
    assert!(!stats.persistence_degraded);

    for id in [first, urgent] {
        wait_for_terminal(&scheduler, id, Duration::from_secs(5)).await;
    }

    scheduler.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cleanup_purges_old_terminal_jobs() {
    let store = Arc::new(InMemoryJobStore::new());
    let config = SchedulerConfig {
        retention_secs: 0,
        ..fast_config()
    };
    let scheduler = JobScheduler::new(
        config,
        Arc::clone(&store) as Arc<dyn omnishot_dispatch::core::JobStore>,
        registry_for(JobKind::GenerateHeadshot, Arc::new(OrderedExecutor::new(1))),
        Arc::new(SystemClock::new()),
    );
    let handle = scheduler.start();

    let id = scheduler
        .add_job(headshot_payload("u-14"), None, None)
        .await
        .unwrap();
    wait_for_terminal(&scheduler, id, Duration::from_secs(5)).await;

    // Zero retention: anything terminal is eligible on the next sweep
    tokio::time::sleep(Duration::from_millis(10)).await;
    let purged = scheduler.cleanup().await;
    assert_eq!(purged, 1);
    assert!(matches!(
        scheduler.job_status(id),
        Err(DispatchError::JobNotFound(_))
    ));
    assert!(store.is_empty(), "cleanup removes the persisted record too");

    scheduler.shutdown();
    handle.await.unwrap();
}
