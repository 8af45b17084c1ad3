use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message recorded when a provider reports failure without any root cause.
pub const UNKNOWN_FAILURE_MESSAGE: &str = "Video generation failed (unknown reason)";

/// Message recorded on jobs cancelled by their owner.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Lifecycle status of a video generation job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Output resolution, ordered from smallest to largest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Resolution {
    #[serde(rename = "480p")]
    #[strum(serialize = "480p")]
    P480,
    #[serde(rename = "720p")]
    #[strum(serialize = "720p")]
    P720,
    #[serde(rename = "1080p")]
    #[strum(serialize = "1080p")]
    P1080,
    #[serde(rename = "4k")]
    #[strum(serialize = "4k")]
    K4,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    #[strum(serialize = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    #[strum(serialize = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    #[strum(serialize = "1:1")]
    Square,
    #[serde(rename = "4:3")]
    #[strum(serialize = "4:3")]
    Classic,
}

/// Generation parameters captured when the job is accepted.
///
/// The accepting path resolves the template once and snapshots its source
/// image and provider preference here, so the worker never reads templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_duration")]
    pub duration_seconds: u32,
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub source_image_url: Option<String>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
}

fn default_duration() -> u32 {
    5
}

fn default_resolution() -> Resolution {
    Resolution::P720
}

fn default_aspect_ratio() -> AspectRatio {
    AspectRatio::Landscape
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            duration_seconds: default_duration(),
            resolution: default_resolution(),
            aspect_ratio: default_aspect_ratio(),
            source_image_url: None,
            preferred_provider: None,
        }
    }
}

/// Fields supplied by the accepting path when a job is created.
#[derive(Debug, Clone)]
pub struct NewVideoJob {
    pub owner_id: Uuid,
    pub template_id: Uuid,
    pub prompt: String,
    pub params: GenerationParams,
    pub credits_charged: i64,
}

/// One generation attempt and its tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub template_id: Uuid,
    pub prompt: String,
    pub params: GenerationParams,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub provider_name: Option<String>,
    pub provider_job_id: Option<String>,
    pub result_url: Option<String>,
    pub result_thumbnail_url: Option<String>,
    pub duration_seconds: Option<u32>,
    pub error_message: Option<String>,
    pub credits_charged: i64,
    pub credits_refunded: bool,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("job {job_id} is {status} and cannot move to {target}")]
pub struct InvalidTransition {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub target: JobStatus,
}

impl VideoJob {
    pub fn new(new: NewVideoJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            template_id: new.template_id,
            prompt: new.prompt,
            params: new.params,
            status: JobStatus::Pending,
            progress_percent: 0,
            provider_name: None,
            provider_job_id: None,
            result_url: None,
            result_thumbnail_url: None,
            duration_seconds: None,
            error_message: None,
            credits_charged: new.credits_charged,
            credits_refunded: false,
            claimed_by: None,
            claim_expires_at: None,
            version: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when another worker holds an unexpired claim on this job.
    pub fn claimed_by_other(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.claim_expires_at) {
            (Some(owner), Some(expires)) => owner != worker_id && expires > now,
            _ => false,
        }
    }

    /// Take the exclusive claim on a pending job. `started_at` is set once.
    pub fn claim(
        &mut self,
        worker_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_status(JobStatus::Pending, JobStatus::Processing)?;
        self.claimed_by = Some(worker_id.to_string());
        self.claim_expires_at = Some(until);
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Record the provider that accepted the job. Provider identity is
    /// assigned exactly once.
    pub fn mark_processing(
        &mut self,
        provider_name: &str,
        provider_job_id: &str,
    ) -> Result<(), InvalidTransition> {
        self.expect_status(JobStatus::Pending, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.provider_name = Some(provider_name.to_string());
        self.provider_job_id = Some(provider_job_id.to_string());
        Ok(())
    }

    /// Raise the progress percentage. Values never decrease and stay below
    /// 100 until the job completes. Returns whether the value changed.
    pub fn advance_progress(&mut self, percent: u8) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        let next = percent.min(99).max(self.progress_percent);
        let changed = next != self.progress_percent;
        self.progress_percent = next;
        changed
    }

    pub fn complete(
        &mut self,
        result_url: String,
        thumbnail_url: Option<String>,
        duration_seconds: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_status(JobStatus::Processing, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress_percent = 100;
        self.result_url = Some(result_url);
        self.result_thumbnail_url = thumbnail_url;
        self.duration_seconds = duration_seconds;
        self.error_message = None;
        self.finish(now);
        Ok(())
    }

    /// Fail a pending or processing job. An empty message falls back to the
    /// generic unknown-reason text.
    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_active(JobStatus::Failed)?;
        let message = message.trim();
        self.status = JobStatus::Failed;
        self.error_message = Some(if message.is_empty() {
            UNKNOWN_FAILURE_MESSAGE.to_string()
        } else {
            message.to_string()
        });
        self.result_url = None;
        self.finish(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_active(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.error_message = Some(CANCELLED_MESSAGE.to_string());
        self.result_url = None;
        self.finish(now);
        Ok(())
    }

    /// Credits are owed back for failed or cancelled jobs not yet refunded.
    pub fn refund_due(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Cancelled) && !self.credits_refunded
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at.get_or_insert(now);
        self.claimed_by = None;
        self.claim_expires_at = None;
    }

    fn expect_status(&self, expected: JobStatus, target: JobStatus) -> Result<(), InvalidTransition> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid(target))
        }
    }

    fn expect_active(&self, target: JobStatus) -> Result<(), InvalidTransition> {
        if self.is_terminal() {
            Err(self.invalid(target))
        } else {
            Ok(())
        }
    }

    fn invalid(&self, target: JobStatus) -> InvalidTransition {
        InvalidTransition {
            job_id: self.id,
            status: self.status,
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> VideoJob {
        VideoJob::new(NewVideoJob {
            owner_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            prompt: "a lighthouse at dusk".to_string(),
            params: GenerationParams::default(),
            credits_charged: 5,
        })
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Cancelled.as_ref(), "cancelled");
        assert_eq!("processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_resolution_ordering_and_parsing() {
        assert!(Resolution::P720 < Resolution::P1080);
        assert_eq!("1080P".parse::<Resolution>().unwrap(), Resolution::P1080);
        assert_eq!(Resolution::K4.to_string(), "4k");
        assert_eq!("9:16".parse::<AspectRatio>().unwrap(), AspectRatio::Portrait);
    }

    #[test]
    fn test_params_defaults_from_empty_json() {
        let params: GenerationParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, GenerationParams::default());
        assert_eq!(params.duration_seconds, 5);
    }

    #[test]
    fn test_completed_job_invariants() {
        let mut job = sample_job();
        let now = Utc::now();
        job.claim("w1", now, now).unwrap();
        job.mark_processing("mock", "task-1").unwrap();
        job.complete("https://cdn/v.mp4".into(), None, Some(5), now).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert!(job.error_message.is_none());
        assert!(job.claimed_by.is_none());
        assert!(!job.refund_due());
    }

    #[test]
    fn test_progress_is_monotonic_and_capped() {
        let mut job = sample_job();
        let now = Utc::now();
        job.claim("w1", now, now).unwrap();
        job.mark_processing("mock", "task-1").unwrap();

        assert!(job.advance_progress(50));
        assert!(!job.advance_progress(10));
        assert_eq!(job.progress_percent, 50);
        assert!(job.advance_progress(100));
        assert_eq!(job.progress_percent, 99);
    }

    #[test]
    fn test_fail_with_empty_message_uses_fallback() {
        let mut job = sample_job();
        job.fail("  ", Utc::now()).unwrap();
        assert_eq!(job.error_message.as_deref(), Some(UNKNOWN_FAILURE_MESSAGE));
        assert!(job.provider_job_id.is_none());
        assert!(job.refund_due());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = sample_job();
        let now = Utc::now();
        job.cancel(now).unwrap();
        assert!(job.fail("late", now).is_err());
        assert!(job.cancel(now).is_err());
        assert_eq!(job.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    }

    #[test]
    fn test_claim_held_by_other_until_expiry() {
        let mut job = sample_job();
        let now = Utc::now();
        job.claim("w1", now + chrono::Duration::seconds(30), now).unwrap();
        assert!(job.claimed_by_other("w2", now));
        assert!(!job.claimed_by_other("w1", now));
        assert!(!job.claimed_by_other("w2", now + chrono::Duration::seconds(31)));
    }
}
