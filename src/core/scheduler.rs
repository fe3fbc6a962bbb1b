//! Job scheduler: lifecycle owner from admission to terminal state.
//!
//! One cooperative loop per scheduler instance coordinates many in-flight
//! executions. The loop is woken by an explicit signal on enqueue and on
//! slot-free, plus a periodic safety tick; it never blocks on a running job.
//! Priority lanes and the active set are process-local; the job store is the
//! only cross-process state, which is why recovery demotes any record still
//! marked `processing` back to `queued`.
//!
//! Lock order is `jobs → lanes → active`, and no lock is ever held across
//! an await point. A record is persisted before it becomes claimable, so a
//! crash never resurrects a newer in-memory state with an older stored one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::error::{DispatchError, ExecutionError};
use crate::core::executor::{CancelToken, ExecutorRegistry, JobContext, ProgressHandle};
use crate::core::job::{Job, JobId, JobPayload, JobStatus, Priority};
use crate::core::lanes::{LaneDepths, PriorityLanes};
use crate::core::store::JobStore;
use crate::util::clock::Clock;

/// How many back-to-back persistence attempts a write gets before the
/// scheduler degrades to in-memory-authoritative for that record.
const PERSIST_ATTEMPTS: u32 = 3;

/// Read-only view of one job for status queries.
#[derive(Debug, Clone)]
pub struct JobStatusView {
    /// Current lifecycle status.
    pub status: JobStatus,
    /// The job's priority lane.
    pub priority: Priority,
    /// Execution attempts started so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Latest progress report, 0-100.
    pub progress: Option<u8>,
    /// Executor result for completed jobs.
    pub result: Option<serde_json::Value>,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs waiting in lanes.
    pub queued: usize,
    /// Jobs currently executing.
    pub processing: usize,
    /// Jobs waiting out a backoff delay.
    pub retrying: usize,
    /// Jobs completed since startup.
    pub completed: u64,
    /// Jobs failed terminally since startup.
    pub failed: u64,
    /// Jobs cancelled since startup.
    pub cancelled: u64,
    /// Jobs accepted since startup.
    pub submitted: u64,
    /// Queue depth per priority lane.
    pub queued_by_priority: LaneDepths,
    /// `processing / max_concurrent`, as a percentage.
    pub capacity_utilization_percent: u8,
    /// True while job-store writes are failing and records are
    /// memory-authoritative.
    pub persistence_degraded: bool,
}

/// What `recover` found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records loaded from the store.
    pub loaded: usize,
    /// Non-terminal records re-queued.
    pub requeued: usize,
    /// Records demoted from `processing`/`retrying` back to `queued`.
    pub demoted: usize,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
}

struct ActiveJob {
    cancel: CancelToken,
    progress: ProgressHandle,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn JobStore>,
    executors: ExecutorRegistry,
    jobs: Mutex<HashMap<JobId, Job>>,
    lanes: Mutex<PriorityLanes>,
    active: Mutex<HashMap<JobId, ActiveJob>>,
    wake: Notify,
    shutdown: AtomicBool,
    persistence_degraded: AtomicBool,
    counters: SchedulerCounters,
}

/// Priority-ordered, bounded-concurrency job scheduler.
///
/// Cheap to clone; clones share one scheduler instance.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Create a scheduler. Call [`recover`](Self::recover) before
    /// [`start`](Self::start) when the store may hold records from a
    /// previous run.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        executors: ExecutorRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                store,
                executors,
                jobs: Mutex::new(HashMap::new()),
                lanes: Mutex::new(PriorityLanes::new()),
                active: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                persistence_degraded: AtomicBool::new(false),
                counters: SchedulerCounters::default(),
            }),
        }
    }

    /// Spawn the processing loop. The loop runs until
    /// [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(Inner::run_loop(inner))
    }

    /// Signal the processing loop to stop. In-flight executions settle on
    /// their own; no new jobs are dequeued.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Submit a job. Validates the payload for its type, rejects when the
    /// queue is at capacity (persisting nothing), persists the record, and
    /// wakes the loop.
    pub async fn add_job(
        &self,
        payload: JobPayload,
        priority: Option<Priority>,
        max_attempts: Option<u32>,
    ) -> Result<JobId, DispatchError> {
        payload.validate()?;
        let kind = payload.kind();
        if !self.inner.executors.contains(kind) {
            return Err(DispatchError::UnknownJobType(kind.to_string()));
        }

        {
            let lanes = self.inner.lanes.lock();
            let active = self.inner.active.lock();
            let in_use = lanes.len() + active.len();
            if in_use >= self.inner.config.max_queue_size {
                return Err(DispatchError::QueueFull {
                    queued: in_use,
                    capacity: self.inner.config.max_queue_size,
                });
            }
        }

        let job = Job::new(
            Uuid::new_v4(),
            payload,
            priority.unwrap_or(Priority::Standard),
            max_attempts.unwrap_or(self.inner.config.default_max_attempts),
            self.inner.clock.now_ms(),
        );

        // Durable before claimable: the loop must never run a job the store
        // has not seen (best-effort under a store outage).
        self.inner.persist_best_effort(&job).await;
        {
            let mut jobs = self.inner.jobs.lock();
            let mut lanes = self.inner.lanes.lock();
            jobs.insert(job.id, job.clone());
            lanes.push(job.priority, job.id);
        }

        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(job_id = %job.id, kind = %kind, priority = %job.priority, "job queued");
        self.inner.wake.notify_one();
        Ok(job.id)
    }

    /// Cancel a job. Queued jobs leave their lane immediately; processing
    /// jobs get their cancellation token flipped and settle cooperatively;
    /// terminal jobs error.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), DispatchError> {
        let job = {
            let mut jobs = self.inner.jobs.lock();
            let mut lanes = self.inner.lanes.lock();
            let active = self.inner.active.lock();

            let job = jobs.get_mut(&id).ok_or(DispatchError::JobNotFound(id))?;
            if job.status.is_terminal() {
                return Err(DispatchError::AlreadyTerminal {
                    id,
                    status: job.status,
                });
            }

            match job.status {
                JobStatus::Queued => {
                    lanes.remove(id);
                }
                JobStatus::Processing => {
                    if let Some(entry) = active.get(&id) {
                        entry.cancel.cancel();
                    }
                }
                // A retrying job's re-enqueue timer observes the status
                // change and stands down.
                JobStatus::Retrying => {}
                _ => {}
            }

            job.status = JobStatus::Cancelled;
            job.finished_at_ms = Some(self.inner.clock.now_ms());
            job.clone()
        };

        self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.inner.persist_best_effort(&job).await;
        tracing::info!(job_id = %id, "job cancelled");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Read one job's status, merging live progress for in-flight jobs.
    pub fn job_status(&self, id: JobId) -> Result<JobStatusView, DispatchError> {
        let jobs = self.inner.jobs.lock();
        let active = self.inner.active.lock();
        let job = jobs.get(&id).ok_or(DispatchError::JobNotFound(id))?;
        let progress = active
            .get(&id)
            .map(|entry| entry.progress.current())
            .or(job.progress);
        Ok(JobStatusView {
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            progress,
            result: job.result.clone(),
            last_error: job.last_error.clone(),
        })
    }

    /// Queue statistics snapshot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn queue_stats(&self) -> QueueStats {
        let jobs = self.inner.jobs.lock();
        let lanes = self.inner.lanes.lock();
        let active = self.inner.active.lock();

        let retrying = jobs
            .values()
            .filter(|job| job.status == JobStatus::Retrying)
            .count();
        let utilization = (active.len() * 100 / self.inner.config.max_concurrent.max(1)).min(255);

        QueueStats {
            queued: lanes.len(),
            processing: active.len(),
            retrying,
            completed: self.inner.counters.completed.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            cancelled: self.inner.counters.cancelled.load(Ordering::Relaxed),
            submitted: self.inner.counters.submitted.load(Ordering::Relaxed),
            queued_by_priority: lanes.depths(),
            capacity_utilization_percent: utilization as u8,
            persistence_degraded: self.inner.persistence_degraded.load(Ordering::Acquire),
        }
    }

    /// Load persisted records on startup. Non-terminal jobs re-enter the
    /// lanes; anything recorded `processing` or `retrying` was interrupted
    /// by the previous shutdown and is demoted to `queued` first. Run this
    /// before [`start`](Self::start).
    pub async fn recover(&self) -> Result<RecoveryReport, DispatchError> {
        let mut records = self.inner.store.load_all().await?;
        // FIFO fidelity across the restart
        records.sort_by_key(|job| job.created_at_ms);

        let mut report = RecoveryReport {
            loaded: records.len(),
            ..RecoveryReport::default()
        };
        let mut demoted_records = Vec::new();

        {
            let mut jobs = self.inner.jobs.lock();
            let mut lanes = self.inner.lanes.lock();

            for mut job in records {
                if !job.status.is_terminal() {
                    if matches!(job.status, JobStatus::Processing | JobStatus::Retrying) {
                        job.status = JobStatus::Queued;
                        job.started_at_ms = None;
                        report.demoted += 1;
                        demoted_records.push(job.clone());
                    }
                    lanes.push(job.priority, job.id);
                    report.requeued += 1;
                }
                jobs.insert(job.id, job);
            }
        }

        for job in demoted_records {
            self.inner.persist_best_effort(&job).await;
        }

        tracing::info!(
            loaded = report.loaded,
            requeued = report.requeued,
            demoted = report.demoted,
            "recovery complete"
        );
        self.inner.wake.notify_one();
        Ok(report)
    }

    /// Purge terminal jobs older than the retention window from memory and
    /// the store. Returns how many were removed. The loop runs this
    /// periodically; it is public for operational tooling.
    pub async fn cleanup(&self) -> usize {
        self.inner.cleanup().await
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn run_loop(inner: Arc<Self>) {
        let tick = Duration::from_millis(inner.config.tick_interval_ms);
        let cleanup_every =
            (inner.config.cleanup_interval_ms / inner.config.tick_interval_ms).max(1);
        let mut ticks_since_cleanup: u64 = 0;
        tracing::info!(
            max_concurrent = inner.config.max_concurrent,
            "scheduler loop started"
        );

        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            Self::fill_slots(&inner).await;

            tokio::select! {
                () = inner.wake.notified() => {}
                () = tokio::time::sleep(tick) => {
                    ticks_since_cleanup += 1;
                    if ticks_since_cleanup >= cleanup_every {
                        ticks_since_cleanup = 0;
                        let purged = inner.cleanup().await;
                        if purged > 0 {
                            tracing::debug!(purged, "retention sweep removed terminal jobs");
                        }
                    }
                }
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    /// Dequeue and start jobs while worker slots are free.
    async fn fill_slots(inner: &Arc<Self>) {
        while let Some((job, cancel, progress)) = inner.try_claim_next() {
            inner.persist_best_effort(&job).await;
            let task_inner = Arc::clone(inner);
            tokio::spawn(Self::dispatch(task_inner, job, cancel, progress));
        }
    }

    /// Claim the next runnable job under the locks: pop the head of the
    /// highest-priority lane, mark it processing, and reserve an active
    /// slot. The attempt counter increments here, when the attempt starts.
    fn try_claim_next(&self) -> Option<(Job, CancelToken, ProgressHandle)> {
        let mut jobs = self.jobs.lock();
        let mut lanes = self.lanes.lock();
        let mut active = self.active.lock();

        if active.len() >= self.config.max_concurrent {
            return None;
        }

        while let Some(id) = lanes.pop_next() {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.started_at_ms = Some(self.clock.now_ms());
            let cancel = CancelToken::new();
            let progress = ProgressHandle::new();
            active.insert(
                id,
                ActiveJob {
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                },
            );
            return Some((job.clone(), cancel, progress));
        }
        None
    }

    /// Run one attempt of a claimed job and settle the outcome.
    async fn dispatch(inner: Arc<Self>, job: Job, cancel: CancelToken, progress: ProgressHandle) {
        let kind = job.kind();
        let id = job.id;
        tracing::debug!(job_id = %id, kind = %kind, attempt = job.attempts, "executing job");

        let outcome = match inner.executors.get(kind) {
            Some(executor) => {
                let ctx = JobContext {
                    job_id: id,
                    attempt: job.attempts,
                    cancel,
                    progress,
                };
                let timeout = inner.config.timeout_for(kind);
                match tokio::time::timeout(timeout, executor.execute(job.payload.clone(), ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Timeout),
                }
            }
            // Submissions are checked against the registry, so this only
            // happens if the registry changed under us.
            None => Err(ExecutionError::Permanent(format!(
                "no executor registered for {kind}"
            ))),
        };

        let requeue_delay_ms = inner.settle(id, outcome).await;
        if let Some(delay_ms) = requeue_delay_ms {
            let timer_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                timer_inner.requeue_after_backoff(id).await;
            });
        }
        inner.wake.notify_one();
    }

    /// Apply an attempt's outcome: completed, retrying with backoff, or
    /// failed. Frees the worker slot; returns the backoff delay when the
    /// job should be re-queued.
    async fn settle(
        &self,
        id: JobId,
        outcome: Result<serde_json::Value, ExecutionError>,
    ) -> Option<u64> {
        let now_ms = self.clock.now_ms();
        let mut requeue_delay_ms: Option<u64> = None;

        let persisted = {
            let mut jobs = self.jobs.lock();
            let mut active = self.active.lock();

            let live_progress = active.get(&id).map(|entry| entry.progress.current());
            active.remove(&id);

            let job = jobs.get_mut(&id)?;
            if let Some(progress) = live_progress {
                job.progress = Some(progress);
            }

            if job.status == JobStatus::Cancelled {
                // Cancelled mid-flight; the terminal record is already
                // written, the slot release is all that was left.
                job.clone()
            } else {
                match outcome {
                    Ok(result) => {
                        job.status = JobStatus::Completed;
                        job.result = Some(result);
                        job.progress = Some(100);
                        job.finished_at_ms = Some(now_ms);
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(job_id = %id, attempts = job.attempts, "job completed");
                    }
                    Err(err) => {
                        job.last_error = Some(err.to_string());
                        if err.is_retryable() && job.attempts < job.max_attempts {
                            job.status = JobStatus::Retrying;
                            let delay = self.config.backoff_delay_ms(job.attempts);
                            requeue_delay_ms = Some(delay);
                            self.counters.retries.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                job_id = %id,
                                attempt = job.attempts,
                                max_attempts = job.max_attempts,
                                delay_ms = delay,
                                error = %err,
                                "job attempt failed; retrying after backoff"
                            );
                        } else {
                            job.status = JobStatus::Failed;
                            job.finished_at_ms = Some(now_ms);
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                job_id = %id,
                                attempts = job.attempts,
                                error = %err,
                                "job failed terminally"
                            );
                        }
                    }
                }
                job.clone()
            }
        };

        self.persist_best_effort(&persisted).await;
        requeue_delay_ms
    }

    /// Move a retrying job back to its lane once its backoff elapses. The
    /// record goes durable as `queued` before the lane sees it.
    async fn requeue_after_backoff(&self, id: JobId) {
        let job = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            // Cancelled (or otherwise moved on) while waiting out the delay
            if job.status != JobStatus::Retrying {
                return;
            }
            job.status = JobStatus::Queued;
            job.clone()
        };

        self.persist_best_effort(&job).await;
        {
            let mut lanes = self.lanes.lock();
            lanes.push(job.priority, id);
        }
        tracing::debug!(job_id = %id, attempt = job.attempts, "job re-queued after backoff");
        self.wake.notify_one();
    }

    /// Persist a record, retrying a few times back-to-back. On exhaustion
    /// the job continues memory-authoritative and the degraded flag is
    /// raised for operators; a later successful write clears it.
    async fn persist_best_effort(&self, job: &Job) {
        let mut last_err = None;
        for _ in 0..PERSIST_ATTEMPTS {
            match self.store.put(job).await {
                Ok(()) => {
                    self.persistence_degraded.store(false, Ordering::Release);
                    return;
                }
                Err(err) => last_err = Some(err),
            }
        }
        self.persistence_degraded.store(true, Ordering::Release);
        tracing::error!(
            job_id = %job.id,
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "job store write failed; continuing with in-memory record"
        );
    }

    async fn cleanup(&self) -> usize {
        let retention_ms = self.config.retention_secs * 1_000;
        let cutoff = self.clock.now_ms().saturating_sub(retention_ms);

        let expired: Vec<JobId> = {
            let mut jobs = self.jobs.lock();
            let ids: Vec<JobId> = jobs
                .values()
                .filter(|job| {
                    job.status.is_terminal() && job.finished_at_ms.is_some_and(|at| at < cutoff)
                })
                .map(|job| job.id)
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };

        for id in &expired {
            if let Err(err) = self.store.delete(*id).await {
                tracing::warn!(job_id = %id, error = %err, "failed to delete expired job record");
            }
        }
        expired.len()
    }
}
