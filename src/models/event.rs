use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::generation::{Progress, Stage};
use crate::models::job::{JobStatus, VideoJob};

/// Progress event pushed to subscribers of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub stage: Stage,
    pub message: String,
    /// Empty until the job completes.
    #[serde(default)]
    pub result_url: String,
}

impl JobEvent {
    /// Snapshot of the persisted record, as a client would see it on
    /// re-query.
    pub fn from_job(job: &VideoJob) -> Self {
        let (stage, message) = match job.status {
            JobStatus::Pending => (Stage::Queued, "Waiting for a worker".to_string()),
            JobStatus::Processing => (Stage::Processing, "Video generation in progress".to_string()),
            JobStatus::Completed => (Stage::Completed, "Video generation completed".to_string()),
            JobStatus::Failed | JobStatus::Cancelled => (
                Stage::Failed,
                job.error_message.clone().unwrap_or_default(),
            ),
        };
        Self {
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            stage,
            message,
            result_url: job.result_url.clone().unwrap_or_default(),
        }
    }

    /// Event for a provider observation projected onto the job record.
    pub fn from_progress(job: &VideoJob, progress: &Progress) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            stage: progress.stage,
            message: progress.message.clone(),
            result_url: job.result_url.clone().unwrap_or_default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
