//! Video generation back-ends.
//!
//! Every vendor sits behind [`VideoProvider`]. The worker and selector only
//! see the trait, so a scripted fake satisfies the same contract as a real
//! HTTP adapter.

pub mod gemini;
pub mod mock;
pub mod wanai;

use std::time::Duration;

use async_trait::async_trait;

use crate::models::generation::{
    GenerationRequest, GenerationResult, Progress, ProviderCapabilities, ProviderHealth,
};

pub use gemini::GeminiProvider;
pub use mock::{MockBehavior, MockProvider};
pub use wanai::WanAiProvider;

/// Uniform contract over a generation back-end.
#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// Registry key, also persisted as the job's provider name.
    fn name(&self) -> &str;

    /// Start a generation. The vendor processes it out of band.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError>;

    /// Current state of a task on the canonical percent scale. Safe to call
    /// repeatedly; unknown vendor statuses map to an in-progress value.
    async fn get_progress(&self, provider_job_id: &str) -> Result<Progress, ProviderError>;

    /// Artifact URL. Only valid after progress reported completion.
    async fn get_result_url(&self, provider_job_id: &str) -> Result<String, ProviderError>;

    /// Best-effort upstream cancellation. May return `NotSupported`.
    async fn cancel(&self, provider_job_id: &str) -> Result<(), ProviderError>;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Lightweight reachability probe. Never fails; an unreachable vendor is
    /// reported as unhealthy.
    async fn health_check(&self) -> ProviderHealth;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The vendor refused the request: invalid input, quota, auth.
    #[error("{provider} rejected the request (status {status:?}, code {code:?}): {message}")]
    Rejected {
        provider: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected vendor response: {0}")]
    Decode(String),

    #[error("Result not ready for task {0}")]
    NotReady(String),

    #[error("{0} does not support this operation")]
    NotSupported(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Normalized text safe to show the job owner. Vendor bodies and
    /// transport details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { message, code, .. } => {
                let cause = if message.trim().is_empty() {
                    code.as_deref().unwrap_or_default()
                } else {
                    message.trim()
                };
                if cause.is_empty() {
                    "Video generation request was rejected".to_string()
                } else {
                    format!("Video generation request was rejected: {cause}")
                }
            }
            Self::Timeout(_) => "Video provider did not respond in time".to_string(),
            Self::NotSupported(_) => "Operation not supported by the video provider".to_string(),
            Self::Http(_) | Self::Decode(_) | Self::NotReady(_) => {
                "Video provider is unavailable".to_string()
            }
        }
    }
}

/// Run a provider call under a deadline.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}

/// Probe health under a deadline, reporting a timed-out probe as unhealthy.
pub async fn probe_with_timeout(provider: &dyn VideoProvider, limit: Duration) -> ProviderHealth {
    let started = std::time::Instant::now();
    match tokio::time::timeout(limit, provider.health_check()).await {
        Ok(health) => health,
        Err(_) => ProviderHealth::unhealthy(started.elapsed().as_millis() as u64),
    }
}

/// Join a base URL and a path without doubling or dropping the slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
