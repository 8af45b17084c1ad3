use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{AspectRatio, GenerationParams, Resolution, VideoJob};

/// Normalized inputs handed to a provider for one generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub job_id: Uuid,
    pub template_id: Uuid,
    pub prompt: String,
    pub source_image_url: Option<String>,
    pub duration_seconds: u32,
    pub resolution: Resolution,
    pub aspect_ratio: AspectRatio,
}

impl GenerationRequest {
    pub fn from_job(job: &VideoJob) -> Self {
        let params: &GenerationParams = &job.params;
        Self {
            job_id: job.id,
            template_id: job.template_id,
            prompt: job.prompt.clone(),
            source_image_url: params.source_image_url.clone(),
            duration_seconds: params.duration_seconds,
            resolution: params.resolution,
            aspect_ratio: params.aspect_ratio,
        }
    }
}

/// What a provider returns when it accepts a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub provider_job_id: String,
    /// Some vendors finish synchronously and hand back the artifact at once.
    pub result_url: Option<String>,
    /// Length of the video the vendor will actually produce.
    pub duration_seconds: u32,
    /// Expected processing time, used to scale the poll interval.
    pub estimated_duration: Duration,
}

/// Canonical progress stage shared by every provider.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Stage {
    /// Percentage on the canonical scale.
    pub fn percent(self) -> u8 {
        match self {
            Self::Queued => 10,
            Self::Processing => 50,
            Self::Completed => 100,
            Self::Failed => 0,
        }
    }
}

/// Percentage reported for vendor statuses that are not recognised.
pub const UNKNOWN_STATUS_PERCENT: u8 = 30;

/// One observation of a provider-side task.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: u8,
    pub stage: Stage,
    pub message: String,
    pub result_url: Option<String>,
    /// Root cause when the stage is `Failed`, if the vendor gave one.
    pub error: Option<String>,
}

impl Progress {
    pub fn at(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            percent: stage.percent(),
            stage,
            message: message.into(),
            result_url: None,
            error: None,
        }
    }

    pub fn completed(result_url: Option<String>) -> Self {
        Self {
            result_url,
            ..Self::at(Stage::Completed, "Video generation completed")
        }
    }

    pub fn failed(error: Option<String>) -> Self {
        let message = match &error {
            Some(cause) => format!("Video generation failed: {cause}"),
            None => "Video generation failed".to_string(),
        };
        Self {
            error,
            ..Self::at(Stage::Failed, message)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Completed | Stage::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QualityTier {
    Draft,
    Standard,
    Premium,
}

/// Static description of what a provider can produce.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCapabilities {
    pub max_duration_seconds: u32,
    pub max_resolution: Resolution,
    pub supported_aspect_ratios: Vec<AspectRatio>,
    pub estimated_time_seconds: u64,
    pub quality_tier: QualityTier,
    pub cost_per_second: f64,
}

impl ProviderCapabilities {
    pub fn supports(&self, request: &GenerationRequest) -> bool {
        request.duration_seconds <= self.max_duration_seconds
            && request.resolution <= self.max_resolution
            && self.supported_aspect_ratios.contains(&request.aspect_ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub response_time_ms: u64,
}

impl ProviderHealth {
    pub fn unhealthy(response_time_ms: u64) -> Self {
        Self {
            healthy: false,
            response_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(duration: u32, resolution: Resolution, ratio: AspectRatio) -> GenerationRequest {
        GenerationRequest {
            job_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            prompt: "waves".to_string(),
            source_image_url: None,
            duration_seconds: duration,
            resolution,
            aspect_ratio: ratio,
        }
    }

    #[test]
    fn test_capabilities_match_on_all_dimensions() {
        let caps = ProviderCapabilities {
            max_duration_seconds: 10,
            max_resolution: Resolution::P1080,
            supported_aspect_ratios: vec![AspectRatio::Landscape, AspectRatio::Portrait],
            estimated_time_seconds: 30,
            quality_tier: QualityTier::Standard,
            cost_per_second: 0.02,
        };

        assert!(caps.supports(&request(5, Resolution::P720, AspectRatio::Landscape)));
        assert!(!caps.supports(&request(12, Resolution::P720, AspectRatio::Landscape)));
        assert!(!caps.supports(&request(5, Resolution::K4, AspectRatio::Landscape)));
        assert!(!caps.supports(&request(5, Resolution::P720, AspectRatio::Square)));
    }

    #[test]
    fn test_canonical_scale() {
        assert_eq!(Stage::Queued.percent(), 10);
        assert_eq!(Stage::Processing.percent(), 50);
        assert_eq!(Progress::completed(None).percent, 100);
        assert_eq!(Progress::failed(None).percent, 0);
        assert!(Progress::failed(None).is_terminal());
    }
}
