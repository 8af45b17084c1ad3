use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::store::{JobStore, StoreError};
use crate::models::event::JobEvent;
use crate::models::job::{InvalidTransition, JobStatus, VideoJob};
use crate::services::credits::{CreditError, CreditLedger};
use crate::services::hub::NotificationHub;
use crate::services::queue::JobQueue;
use crate::services::retry::{with_retry, RetryConfig};
use crate::services::selector::ProviderSelector;

/// Conflicting writes tolerated while settling one job.
const MAX_SETTLE_CONFLICTS: usize = 3;

/// Shared collaborators of the dispatch pipeline.
///
/// These are the only cross-worker mutable resources; each is safe for
/// concurrent use on its own.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<dyn CreditLedger>,
    pub selector: Arc<ProviderSelector>,
    pub hub: Arc<NotificationHub>,
    pub retry: RetryConfig,
}

/// The terminal transition being applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Completed {
        result_url: String,
        thumbnail_url: Option<String>,
        duration_seconds: Option<u32>,
    },
    Failed(String),
    Cancelled,
}

impl Terminal {
    fn apply(&self, job: &mut VideoJob, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        match self {
            Self::Completed {
                result_url,
                thumbnail_url,
                duration_seconds,
            } => job.complete(result_url.clone(), thumbnail_url.clone(), *duration_seconds, now),
            Self::Failed(message) => job.fail(message, now),
            Self::Cancelled => job.cancel(now),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl Pipeline {
    /// Move `job` to a terminal state, refunding credits when owed, then
    /// notify subscribers.
    ///
    /// The refund is issued before the record is saved. The ledger dedupes
    /// refunds per job, so a crash between the two steps is repaired by the
    /// next attempt without paying twice. Returns `None` when another writer
    /// already finished the job.
    pub async fn settle(
        &self,
        mut job: VideoJob,
        terminal: Terminal,
    ) -> Result<Option<VideoJob>, SettleError> {
        for _ in 0..MAX_SETTLE_CONFLICTS {
            if job.is_terminal() {
                tracing::info!(job_id = %job.id, status = %job.status, "Job already finished elsewhere");
                return Ok(None);
            }

            let mut next = job.clone();
            terminal.apply(&mut next, Utc::now())?;
            if next.refund_due() {
                self.refund(&next).await?;
                next.credits_refunded = true;
            }

            match with_retry(&self.retry, "settle_job", || self.store.update(&next)).await {
                Ok(saved) => {
                    self.after_settle(&saved).await;
                    return Ok(Some(saved));
                }
                Err(StoreError::Conflict { .. }) => {
                    job = with_retry(&self.retry, "reload_job", || self.store.get_by_id(next.id)).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict {
            job_id: job.id,
            expected: job.version,
        }
        .into())
    }

    async fn refund(&self, job: &VideoJob) -> Result<(), CreditError> {
        if job.credits_charged <= 0 {
            return Ok(());
        }
        let returned = with_retry(&self.retry, "refund_credits", || {
            self.ledger.refund(job.owner_id, job.credits_charged, job.id)
        })
        .await?;

        if returned {
            metrics::counter!("video_credit_refunds_total").increment(1);
            tracing::info!(
                job_id = %job.id,
                owner_id = %job.owner_id,
                credits = job.credits_charged,
                "Credits refunded"
            );
        } else {
            tracing::debug!(job_id = %job.id, "Refund already recorded");
        }
        Ok(())
    }

    async fn after_settle(&self, job: &VideoJob) {
        match job.status {
            JobStatus::Completed => metrics::counter!("video_jobs_completed_total").increment(1),
            JobStatus::Failed => metrics::counter!("video_jobs_failed_total").increment(1),
            JobStatus::Cancelled => metrics::counter!("video_jobs_cancelled_total").increment(1),
            JobStatus::Pending | JobStatus::Processing => {}
        }

        tracing::info!(
            job_id = %job.id,
            status = %job.status,
            provider = job.provider_name.as_deref().unwrap_or_default(),
            provider_job_id = job.provider_job_id.as_deref().unwrap_or_default(),
            error = job.error_message.as_deref().unwrap_or_default(),
            "Job finished"
        );

        if let Err(e) = self.queue.clear_cancel(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to clear cancel request");
        }
        self.hub.publish(job.id, &JobEvent::from_job(job)).await;
    }
}
