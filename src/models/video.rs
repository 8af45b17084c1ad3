use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{AspectRatio, GenerationParams, JobStatus, Resolution, VideoJob};

/// Request to generate a video from a template.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateVideoRequest {
    #[garde(skip)]
    pub template_id: Uuid,

    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,

    #[garde(range(min = 1, max = 60))]
    #[serde(default = "default_duration")]
    pub duration_seconds: u32,

    #[garde(skip)]
    #[serde(default)]
    pub resolution: Option<Resolution>,

    #[garde(skip)]
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,

    #[garde(length(min = 1, max = 2048))]
    #[serde(default)]
    pub source_image_url: Option<String>,

    #[garde(length(min = 1, max = 64))]
    #[serde(default)]
    pub preferred_provider: Option<String>,
}

fn default_duration() -> u32 {
    5
}

impl GenerateVideoRequest {
    pub fn params(&self) -> GenerationParams {
        let defaults = GenerationParams::default();
        GenerationParams {
            duration_seconds: self.duration_seconds,
            resolution: self.resolution.unwrap_or(defaults.resolution),
            aspect_ratio: self.aspect_ratio.unwrap_or(defaults.aspect_ratio),
            source_image_url: self.source_image_url.clone(),
            preferred_provider: self.preferred_provider.clone(),
        }
    }
}

/// Response after a generation request is accepted.
#[derive(Debug, Serialize)]
pub struct GenerateVideoResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub credits_charged: i64,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub provider: Option<String>,
    pub result_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<u32>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&VideoJob> for JobStatusResponse {
    fn from(job: &VideoJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            provider: job.provider_name.clone(),
            result_url: job.result_url.clone(),
            thumbnail_url: job.result_thumbnail_url.clone(),
            duration_seconds: job.duration_seconds,
            error: job.error_message.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Filter for `GET /api/v1/videos`. Without `status` every job is listed.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<JobStatus>,
}
