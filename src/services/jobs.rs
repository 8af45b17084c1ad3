//! Accepting path: charge, persist, enqueue, and owner-scoped reads.

use uuid::Uuid;

use crate::db::store::StoreError;
use crate::models::job::{JobStatus, NewVideoJob, VideoJob};
use crate::models::video::GenerateVideoRequest;
use crate::services::credits::{price_for, CreditError};
use crate::services::pipeline::{Pipeline, SettleError, Terminal};
use crate::services::queue::QueueError;
use crate::services::retry::with_retry;

/// Message recorded when a charged job could not be handed to the queue.
pub const ENQUEUE_FAILED_MESSAGE: &str = "Video generation could not be scheduled";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {job_id} already finished as {status}")]
    AlreadyFinished { job_id: Uuid, status: JobStatus },

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Settle(#[from] SettleError),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Client-facing job operations on top of the shared pipeline.
#[derive(Clone)]
pub struct JobService {
    pipeline: Pipeline,
}

impl JobService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Charge the owner, persist a pending job, and enqueue it.
    ///
    /// A job that was charged but never reached the queue is failed with a
    /// refund before the error is returned.
    pub async fn submit(&self, owner: Uuid, request: &GenerateVideoRequest) -> Result<VideoJob, JobError> {
        let credits = price_for(request.duration_seconds);
        self.pipeline.ledger.charge(owner, credits).await?;

        let job = VideoJob::new(NewVideoJob {
            owner_id: owner,
            template_id: request.template_id,
            prompt: request.prompt.clone(),
            params: request.params(),
            credits_charged: credits,
        });

        if let Err(e) = with_retry(&self.pipeline.retry, "create_job", || self.pipeline.store.create(&job)).await {
            tracing::error!(job_id = %job.id, owner_id = %owner, error = %e, "Failed to persist job; refunding");
            if let Err(refund_err) = self.pipeline.ledger.refund(owner, credits, job.id).await {
                tracing::error!(job_id = %job.id, error = %refund_err, "Refund after failed create also failed");
            }
            return Err(e.into());
        }

        if let Err(e) = with_retry(&self.pipeline.retry, "enqueue_job", || self.pipeline.queue.enqueue(job.id)).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue job; failing it");
            self.pipeline
                .settle(job, Terminal::Failed(ENQUEUE_FAILED_MESSAGE.to_string()))
                .await?;
            return Err(e.into());
        }

        metrics::counter!("video_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            owner_id = %owner,
            template_id = %job.template_id,
            duration_seconds = job.params.duration_seconds,
            credits,
            "Video job submitted"
        );
        Ok(job)
    }

    /// The owner's job. Jobs of other owners read as missing.
    pub async fn get(&self, owner: Uuid, id: Uuid) -> Result<VideoJob, JobError> {
        let job = self.pipeline.store.get_by_id(id).await?;
        if job.owner_id != owner {
            return Err(JobError::NotFound(id));
        }
        Ok(job)
    }

    /// The owner's jobs, oldest first, optionally in one status.
    pub async fn list(&self, owner: Uuid, status: Option<JobStatus>) -> Result<Vec<VideoJob>, JobError> {
        Ok(self.pipeline.store.list_by_status(status, Some(owner)).await?)
    }

    /// Signal the worker owning the job to stop it. The transition itself is
    /// applied by the worker, which holds the claim.
    pub async fn request_cancel(&self, owner: Uuid, id: Uuid) -> Result<VideoJob, JobError> {
        let job = self.get(owner, id).await?;
        if job.is_terminal() {
            return Err(JobError::AlreadyFinished {
                job_id: id,
                status: job.status,
            });
        }
        self.pipeline.queue.request_cancel(id).await?;
        tracing::info!(job_id = %id, status = %job.status, "Cancellation requested");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::db::store::{InMemoryJobStore, JobStore};
    use crate::models::job::GenerationParams;
    use crate::services::credits::{CreditLedger, InMemoryCreditLedger};
    use crate::services::hub::NotificationHub;
    use crate::services::provider_health::HealthMonitor;
    use crate::services::queue::{InMemoryJobQueue, JobQueue};
    use crate::services::registry::ProviderRegistry;
    use crate::services::retry::RetryConfig;
    use crate::services::selector::ProviderSelector;

    struct Fixture {
        service: JobService,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryJobQueue>,
        ledger: Arc<InMemoryCreditLedger>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(30)));
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let pipeline = Pipeline {
            store: store.clone(),
            queue: queue.clone(),
            ledger: ledger.clone(),
            selector: Arc::new(ProviderSelector::new(
                Arc::new(ProviderRegistry::new()),
                Arc::new(HealthMonitor::new(Duration::from_secs(30), Duration::from_secs(1))),
            )),
            hub: Arc::new(NotificationHub::new(8)),
            retry: RetryConfig::default(),
        };
        Fixture {
            service: JobService::new(pipeline),
            store,
            queue,
            ledger,
        }
    }

    fn request(duration: u32) -> GenerateVideoRequest {
        serde_json::from_value(serde_json::json!({
            "template_id": Uuid::new_v4(),
            "prompt": "paper boats in the rain",
            "duration_seconds": duration,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_charges_and_enqueues() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        fx.ledger.deposit(owner, 20).await;

        let job = fx.service.submit(owner, &request(8)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.credits_charged, 8);
        assert_eq!(job.params, GenerationParams { duration_seconds: 8, ..GenerationParams::default() });
        assert_eq!(fx.ledger.balance(owner).await.unwrap(), 12);
        assert_eq!(fx.queue.depth().await.unwrap(), 1);
        assert_eq!(fx.store.get_by_id(job.id).await.unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_submit_without_credits_creates_nothing() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        fx.ledger.deposit(owner, 2).await;

        let err = fx.service.submit(owner, &request(5)).await.unwrap_err();
        assert!(matches!(err, JobError::Credit(CreditError::InsufficientCredits { required: 5, .. })));
        assert_eq!(fx.queue.depth().await.unwrap(), 0);
        assert!(fx.service.list(owner, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_owners_jobs_are_hidden() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        fx.ledger.deposit(owner, 10).await;
        let job = fx.service.submit(owner, &request(5)).await.unwrap();

        assert_ok!(fx.service.get(owner, job.id).await);
        let err = assert_err!(fx.service.get(Uuid::new_v4(), job.id).await);
        assert!(matches!(err, JobError::NotFound(id) if id == job.id));
        assert!(fx
            .service
            .list(Uuid::new_v4(), Some(JobStatus::Pending))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_without_status_returns_every_job() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        fx.ledger.deposit(owner, 20).await;
        let pending = fx.service.submit(owner, &request(5)).await.unwrap();
        let cancelled = fx.service.submit(owner, &request(5)).await.unwrap();
        fx.service
            .pipeline()
            .settle(cancelled.clone(), Terminal::Cancelled)
            .await
            .unwrap();

        let all = fx.service.list(owner, None).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|job| job.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&pending.id) && ids.contains(&cancelled.id));

        let only_pending = fx.service.list(owner, Some(JobStatus::Pending)).await.unwrap();
        assert_eq!(only_pending.len(), 1);
        assert_eq!(only_pending[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_cancel_signals_queue_and_rejects_finished_jobs() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        fx.ledger.deposit(owner, 10).await;
        let job = fx.service.submit(owner, &request(5)).await.unwrap();

        fx.service.request_cancel(owner, job.id).await.unwrap();
        assert!(fx.queue.is_cancel_requested(job.id).await.unwrap());

        fx.service
            .pipeline()
            .settle(job.clone(), Terminal::Cancelled)
            .await
            .unwrap();
        let err = fx.service.request_cancel(owner, job.id).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::AlreadyFinished {
                status: JobStatus::Cancelled,
                ..
            }
        ));
    }
}
