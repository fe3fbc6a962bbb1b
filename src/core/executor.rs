//! Executor port, per-job context, and the type-to-executor registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::ExecutionError;
use crate::core::job::{JobId, JobKind, JobPayload};

/// Cooperative cancellation token handed to executors.
///
/// Cancellation is never preemptive: the scheduler flips the flag and the
/// executor is expected to poll `is_cancelled` at safe points and abandon
/// work it has not committed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Live progress slot shared between an executor and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    percent: Arc<AtomicU8>,
}

impl ProgressHandle {
    /// Create a handle at zero percent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report progress; values above 100 are clamped.
    pub fn report(&self, percent: u8) {
        self.percent.store(percent.min(100), Ordering::Release);
    }

    /// Read the most recent report.
    pub fn current(&self) -> u8 {
        self.percent.load(Ordering::Acquire)
    }
}

/// Per-attempt context passed to an executor alongside the payload.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job being executed.
    pub job_id: JobId,
    /// Which attempt this is, starting at 1.
    pub attempt: u32,
    /// Cooperative cancellation flag; poll at safe points.
    pub cancel: CancelToken,
    /// Progress reporting slot, surfaced through `job_status`.
    pub progress: ProgressHandle,
}

/// Abstraction for executing one job type's payloads.
///
/// Executors perform the actual slow, expensive work, e.g. calling an AI
/// transformation provider. They report transient faults (timeouts,
/// transport errors, upstream 5xx-equivalents) as
/// [`ExecutionError::Transient`] so the scheduler retries with backoff, and
/// unrecoverable conditions as [`ExecutionError::Permanent`].
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone)]
/// struct HeadshotExecutor { provider: ProviderClient }
///
/// #[async_trait]
/// impl JobExecutor for HeadshotExecutor {
///     async fn execute(
///         &self,
///         payload: JobPayload,
///         ctx: JobContext,
///     ) -> Result<serde_json::Value, ExecutionError> {
///         let JobPayload::GenerateHeadshot { user_id, source_key, style } = payload else {
///             return Err(ExecutionError::Permanent("wrong payload type".into()));
///         };
///         ctx.progress.report(10);
///         if ctx.cancel.is_cancelled() {
///             return Err(ExecutionError::Permanent("cancelled".into()));
///         }
///         let image = self.provider.transform(&source_key, &style).await
///             .map_err(|e| ExecutionError::Transient(e.to_string()))?;
///         Ok(serde_json::json!({ "output_key": image.key }))
///     }
/// }
/// ```
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute one attempt of a job. The returned JSON value is stored on
    /// the job record as its result.
    async fn execute(
        &self,
        payload: JobPayload,
        ctx: JobContext,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Registry mapping each job type to its executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobKind, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for a job type, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(kind, executor);
    }

    /// Look up the executor for a job type.
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Whether a job type has a registered executor.
    pub fn contains(&self, kind: JobKind) -> bool {
        self.executors.contains_key(&kind)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}
