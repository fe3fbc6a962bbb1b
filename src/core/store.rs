//! Durable job-record port.

use async_trait::async_trait;

use crate::core::error::StoreError;
use crate::core::job::{Job, JobId};

/// Abstraction for durable job persistence, one record per job keyed by id.
///
/// The store must survive process restarts; `recover` reads it back on
/// startup. Multiple service instances may share a store, which is why
/// records found `processing` at recovery are demoted rather than trusted.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite the record for `job.id`.
    async fn put(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a record by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Delete a record by id. Deleting a missing record is not an error.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Load every persisted record.
    async fn load_all(&self) -> Result<Vec<Job>, StoreError>;
}
