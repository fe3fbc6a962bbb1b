//! Job records, statuses, priorities, and the typed payload union.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::DispatchError;

/// Unique, immutable job identifier.
pub type JobId = Uuid;

/// Priority used for queue ordering. Strictly ordered: urgent beats high
/// beats standard beats low; FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Reserved for operator-initiated and paid-rush work.
    Urgent,
    /// Interactive requests the user is waiting on.
    High,
    /// Default for ordinary submissions.
    Standard,
    /// Batch and background work.
    Low,
}

impl Priority {
    /// All priorities, highest first. Lane iteration order.
    pub const ALL: [Self; 4] = [Self::Urgent, Self::High, Self::Standard, Self::Low];

    /// Index of this priority's lane, 0 = urgent.
    pub fn lane(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Standard => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Standard => "standard",
            Self::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Status of a job in the scheduler lifecycle.
///
/// Transitions: `Queued → Processing → {Completed | Failed | Retrying}`,
/// `Retrying → Queued` after backoff, `Queued | Processing | Retrying →
/// Cancelled`. `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a priority lane.
    Queued,
    /// An executor is running the job.
    Processing,
    /// Failed transiently; a backoff timer will re-queue it.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Exhausted retries or failed permanently.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal (immutable except cleanup deletion).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Job type discriminant, used to route payloads to registered executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// AI headshot generation from an uploaded photo.
    GenerateHeadshot,
    /// Re-render an approved headshot at a platform's required geometry.
    OptimizePlatformImage,
    /// Bundle a user's finished images into a downloadable archive.
    ExportBatch,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GenerateHeadshot => "generate_headshot",
            Self::OptimizePlatformImage => "optimize_platform_image",
            Self::ExportBatch => "export_batch",
        };
        write!(f, "{name}")
    }
}

/// Typed job payload, tagged by job type. Each variant carries exactly the
/// fields its executor needs; validation runs before anything is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Transform an uploaded photo into a styled professional headshot.
    GenerateHeadshot {
        /// Owning user.
        user_id: String,
        /// Storage key of the uploaded source image.
        source_key: String,
        /// Requested headshot style preset.
        style: String,
    },
    /// Re-render a finished headshot for a target platform's dimensions.
    OptimizePlatformImage {
        /// Owning user.
        user_id: String,
        /// Storage key of the image to optimize.
        image_key: String,
        /// Target platform identifier.
        platform: String,
        /// Target width in pixels.
        width: u32,
        /// Target height in pixels.
        height: u32,
    },
    /// Assemble a set of finished images into one export archive.
    ExportBatch {
        /// Owning user.
        user_id: String,
        /// Storage keys of the images to include.
        image_keys: Vec<String>,
        /// Archive format, e.g. `zip`.
        format: String,
    },
}

impl JobPayload {
    /// The job type this payload dispatches to.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::GenerateHeadshot { .. } => JobKind::GenerateHeadshot,
            Self::OptimizePlatformImage { .. } => JobKind::OptimizePlatformImage,
            Self::ExportBatch { .. } => JobKind::ExportBatch,
        }
    }

    /// Check required fields for this payload's type. Validation failures
    /// are surfaced immediately and never retried.
    pub fn validate(&self) -> Result<(), DispatchError> {
        fn require(field: &str, value: &str) -> Result<(), DispatchError> {
            if value.trim().is_empty() {
                return Err(DispatchError::Validation(format!("{field} is required")));
            }
            Ok(())
        }

        match self {
            Self::GenerateHeadshot {
                user_id,
                source_key,
                style,
            } => {
                require("user_id", user_id)?;
                require("source_key", source_key)?;
                require("style", style)
            }
            Self::OptimizePlatformImage {
                user_id,
                image_key,
                platform,
                width,
                height,
            } => {
                require("user_id", user_id)?;
                require("image_key", image_key)?;
                require("platform", platform)?;
                if *width == 0 || *height == 0 {
                    return Err(DispatchError::Validation(
                        "width and height must be positive".into(),
                    ));
                }
                Ok(())
            }
            Self::ExportBatch {
                user_id,
                image_keys,
                format,
            } => {
                require("user_id", user_id)?;
                require("format", format)?;
                if image_keys.is_empty() {
                    return Err(DispatchError::Validation(
                        "image_keys must not be empty".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Persisted job record. Created only by `add_job`, mutated only by the
/// scheduler, deleted only by the retention sweep once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, immutable for the job's lifetime.
    pub id: JobId,
    /// Typed payload; determines the executor.
    pub payload: JobPayload,
    /// Queue ordering class.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Execution attempts started so far.
    pub attempts: u32,
    /// Attempts allowed before the job fails terminally.
    pub max_attempts: u32,
    /// Submission timestamp, milliseconds since epoch.
    pub created_at_ms: u64,
    /// When the most recent attempt started.
    pub started_at_ms: Option<u64>,
    /// When the job reached a terminal status.
    pub finished_at_ms: Option<u64>,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
    /// Executor result for completed jobs.
    pub result: Option<serde_json::Value>,
    /// Most recent progress report, 0-100.
    pub progress: Option<u8>,
}

impl Job {
    /// Build a freshly queued job record.
    pub fn new(
        id: JobId,
        payload: JobPayload,
        priority: Priority,
        max_attempts: u32,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id,
            payload,
            priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            created_at_ms,
            started_at_ms: None,
            finished_at_ms: None,
            last_error: None,
            result: None,
            progress: None,
        }
    }

    /// The job type this record dispatches to.
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}
