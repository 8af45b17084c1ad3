use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::generation::{
    GenerationRequest, GenerationResult, Progress, ProviderCapabilities, ProviderHealth,
    QualityTier, Stage,
};
use crate::models::job::{AspectRatio, Resolution};
use crate::services::providers::{ProviderError, VideoProvider};

/// How a [`MockProvider`] behaves.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Tasks complete after the configured number of polls.
    Succeed,
    /// `generate` is refused.
    RejectGenerate { message: String },
    /// Tasks report failure once they would have completed.
    FailDuringProgress { error: Option<String> },
    /// Health probes report the provider down. Generation still works.
    Unhealthy,
    /// Tasks are accepted but every progress check fails.
    ProgressUnavailable,
}

/// In-memory provider for development and tests.
///
/// Each task moves one canonical step per `get_progress` call: queued, then
/// processing until `polls_to_finish` calls have been made, then its final
/// state.
pub struct MockProvider {
    name: String,
    behavior: MockBehavior,
    capabilities: ProviderCapabilities,
    polls_to_finish: usize,
    cancel_supported: bool,
    tasks: Mutex<HashMap<String, usize>>,
    generate_calls: AtomicUsize,
    progress_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            capabilities: Self::default_capabilities(),
            polls_to_finish: 2,
            cancel_supported: true,
            tasks: Mutex::new(HashMap::new()),
            generate_calls: AtomicUsize::new(0),
            progress_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn default_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            max_duration_seconds: 60,
            max_resolution: Resolution::P1080,
            supported_aspect_ratios: vec![
                AspectRatio::Landscape,
                AspectRatio::Portrait,
                AspectRatio::Square,
                AspectRatio::Classic,
            ],
            estimated_time_seconds: 10,
            quality_tier: QualityTier::Standard,
            cost_per_second: 0.0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_polls_to_finish(mut self, polls: usize) -> Self {
        self.polls_to_finish = polls;
        self
    }

    pub fn without_cancel(mut self) -> Self {
        self.cancel_supported = false;
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn progress_calls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn result_url(provider_job_id: &str) -> String {
        format!("https://mock.video.local/{provider_job_id}.mp4")
    }
}

#[async_trait]
impl VideoProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);

        if let MockBehavior::RejectGenerate { message } = &self.behavior {
            return Err(ProviderError::Rejected {
                provider: self.name.clone(),
                status: Some(400),
                code: Some("MockRejected".to_string()),
                message: message.clone(),
            });
        }

        let task_id = format!("mock-{}", Uuid::new_v4());
        self.tasks.lock().await.insert(task_id.clone(), 0);
        tracing::debug!(job_id = %request.job_id, task_id = %task_id, "Mock generation started");

        Ok(GenerationResult {
            provider_job_id: task_id,
            result_url: None,
            duration_seconds: request.duration_seconds,
            estimated_duration: Duration::from_secs(self.capabilities.estimated_time_seconds),
        })
    }

    async fn get_progress(&self, provider_job_id: &str) -> Result<Progress, ProviderError> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior == MockBehavior::ProgressUnavailable {
            return Err(ProviderError::Decode(format!("status of {provider_job_id} unavailable")));
        }

        let mut tasks = self.tasks.lock().await;
        let polls = tasks
            .get_mut(provider_job_id)
            .ok_or_else(|| ProviderError::Decode(format!("unknown task {provider_job_id}")))?;
        let seen = *polls;
        *polls += 1;

        if seen >= self.polls_to_finish {
            return Ok(match &self.behavior {
                MockBehavior::FailDuringProgress { error } => Progress::failed(error.clone()),
                _ => Progress::completed(None),
            });
        }
        if seen == 0 {
            return Ok(Progress::at(Stage::Queued, "Video generation queued"));
        }
        Ok(Progress::at(Stage::Processing, "Video generation in progress"))
    }

    async fn get_result_url(&self, provider_job_id: &str) -> Result<String, ProviderError> {
        let tasks = self.tasks.lock().await;
        match tasks.get(provider_job_id) {
            Some(polls) if *polls > self.polls_to_finish => Ok(Self::result_url(provider_job_id)),
            _ => Err(ProviderError::NotReady(provider_job_id.to_string())),
        }
    }

    async fn cancel(&self, provider_job_id: &str) -> Result<(), ProviderError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if !self.cancel_supported {
            return Err(ProviderError::NotSupported(self.name.clone()));
        }
        self.tasks.lock().await.remove(provider_job_id);
        Ok(())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn health_check(&self) -> ProviderHealth {
        ProviderHealth {
            healthy: self.behavior != MockBehavior::Unhealthy,
            response_time_ms: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{GenerationParams, NewVideoJob, VideoJob};

    fn request() -> GenerationRequest {
        GenerationRequest::from_job(&VideoJob::new(NewVideoJob {
            owner_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            prompt: "city lights".to_string(),
            params: GenerationParams::default(),
            credits_charged: 5,
        }))
    }

    #[tokio::test]
    async fn test_steps_through_canonical_stages() {
        let provider = MockProvider::new("mock", MockBehavior::Succeed);
        let started = provider.generate(&request()).await.unwrap();
        let id = started.provider_job_id;

        assert!(provider.get_result_url(&id).await.is_err());
        assert_eq!(provider.get_progress(&id).await.unwrap().percent, 10);
        assert_eq!(provider.get_progress(&id).await.unwrap().percent, 50);
        let done = provider.get_progress(&id).await.unwrap();
        assert_eq!(done.stage, Stage::Completed);
        assert_eq!(done.percent, 100);
        assert!(provider.get_result_url(&id).await.unwrap().ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_failure_without_cause() {
        let provider =
            MockProvider::new("mock", MockBehavior::FailDuringProgress { error: None })
                .with_polls_to_finish(0);
        let id = provider.generate(&request()).await.unwrap().provider_job_id;
        let progress = provider.get_progress(&id).await.unwrap();
        assert_eq!(progress.stage, Stage::Failed);
        assert!(progress.error.is_none());
    }

    #[tokio::test]
    async fn test_progress_unavailable() {
        let provider = MockProvider::new("mock", MockBehavior::ProgressUnavailable);
        let id = provider.generate(&request()).await.unwrap().provider_job_id;
        assert!(provider.get_progress(&id).await.is_err());
        assert!(provider.get_progress(&id).await.is_err());
        assert_eq!(provider.progress_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_not_supported() {
        let provider = MockProvider::new("mock", MockBehavior::Succeed).without_cancel();
        let err = provider.cancel("mock-x").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotSupported(_)));
        assert_eq!(provider.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_probe() {
        let provider = MockProvider::new("mock", MockBehavior::Unhealthy);
        assert!(!provider.health_check().await.healthy);
    }
}
