use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{JobStatus, VideoJob};

/// Durable keyed storage for job records.
///
/// `update` is optimistic: it succeeds only when the submitted record's
/// `version` matches the stored one, and returns the record with the bumped
/// version. A mismatch means another writer got there first.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &VideoJob) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<VideoJob, StoreError>;

    async fn update(&self, job: &VideoJob) -> Result<VideoJob, StoreError>;

    /// Jobs oldest first, optionally restricted to one status and one owner.
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        owner: Option<Uuid>,
    ) -> Result<Vec<VideoJob>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {job_id} was modified concurrently (expected version {expected})")]
    Conflict { job_id: Uuid, expected: i64 },

    #[error("Job already exists: {0}")]
    Duplicate(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: Uuid, reason: String },
}

impl StoreError {
    /// Errors worth retrying with backoff. Conflicts and missing records are
    /// answers, not outages.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Process-local store, used by tests and single-process development runs.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, VideoJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &VideoJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<VideoJob, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, job: &VideoJob) -> Result<VideoJob, StoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;
        if stored.version != job.version {
            return Err(StoreError::Conflict {
                job_id: job.id,
                expected: job.version,
            });
        }

        let mut next = job.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        owner: Option<Uuid>,
    ) -> Result<Vec<VideoJob>, StoreError> {
        let mut matching: Vec<VideoJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| {
                status.map_or(true, |s| job.status == s) && owner.map_or(true, |o| job.owner_id == o)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|job| job.created_at);
        Ok(matching)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
