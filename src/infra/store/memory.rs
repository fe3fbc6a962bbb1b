//! In-memory job store for development and tests.
//!
//! Not durable across processes, but shareable across scheduler instances
//! within one, which is what the crash-recovery tests lean on.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::error::StoreError;
use crate::core::job::{Job, JobId};
use crate::core::store::JobStore;

/// In-memory implementation of the job store port.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.records.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.records.lock().remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{JobPayload, Priority};
    use uuid::Uuid;

    fn sample_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            JobPayload::GenerateHeadshot {
                user_id: "u-1".into(),
                source_key: "uploads/u-1/a.png".into(),
                style: "corporate".into(),
            },
            Priority::Standard,
            3,
            1_000,
        )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryJobStore::new();
        let job = sample_job();

        store.put(&job).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(job.id).await.unwrap().is_some());

        store.delete(job.id).await.unwrap();
        assert!(store.get(job.id).await.unwrap().is_none());
        assert!(store.is_empty());

        // Deleting a missing record is not an error
        store.delete(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = InMemoryJobStore::new();
        let mut job = sample_job();

        store.put(&job).await.unwrap();
        job.attempts = 2;
        store.put(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts, 2);
        assert_eq!(store.len(), 1);
    }
}
