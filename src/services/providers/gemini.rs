//! Google Veo through the Gemini API's long-running operations.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::models::generation::{
    GenerationRequest, GenerationResult, Progress, ProviderCapabilities, ProviderHealth,
    QualityTier, Stage,
};
use crate::models::job::{AspectRatio, Resolution};
use crate::services::providers::{join_url, ProviderError, VideoProvider};

pub const PROVIDER_NAME: &str = "gemini";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "veo-3.0-generate-001";

const MAX_DURATION_SECONDS: u32 = 8;

#[derive(Debug, Default, Deserialize)]
struct Operation {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<OperationResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    #[serde(default)]
    generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideoResponse {
    #[serde(default)]
    generated_samples: Vec<GeneratedSample>,
    #[serde(default)]
    rai_media_filtered_reasons: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeneratedSample {
    #[serde(default)]
    video: Option<VideoRef>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoRef {
    #[serde(default)]
    uri: Option<String>,
}

impl Operation {
    fn video_uri(&self) -> Option<String> {
        self.generated()?
            .generated_samples
            .iter()
            .find_map(|sample| sample.video.as_ref()?.uri.clone())
            .filter(|uri| !uri.is_empty())
    }

    fn generated(&self) -> Option<&GenerateVideoResponse> {
        self.response.as_ref()?.generate_video_response.as_ref()
    }

    fn failure_cause(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return error
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .or_else(|| error.code.map(|c| format!("error code {c}")));
        }
        self.generated()
            .and_then(|generated| generated.rai_media_filtered_reasons.first().cloned())
    }
}

fn map_operation(operation: &Operation) -> Progress {
    if !operation.done {
        return Progress::at(Stage::Processing, "Video generation in progress");
    }
    if operation.error.is_none() {
        if let Some(uri) = operation.video_uri() {
            return Progress::completed(Some(uri));
        }
    }
    Progress::failed(operation.failure_cause())
}

fn resolution_param(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::P1080 | Resolution::K4 => "1080p",
        Resolution::P480 | Resolution::P720 => "720p",
    }
}

pub struct GeminiProvider {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(
        api_key: String,
        base_url: Option<&str>,
        model: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    async fn fetch_operation(&self, name: &str) -> Result<Operation, ProviderError> {
        let response = self
            .http
            .get(join_url(&self.base_url, name))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(rejection(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ProviderError::Decode(format!("operation: {e}")))
    }
}

fn rejection(status: StatusCode, body: &str) -> ProviderError {
    #[derive(Default, Deserialize)]
    struct Envelope {
        #[serde(default)]
        error: Option<ApiError>,
    }
    #[derive(Default, Deserialize)]
    struct ApiError {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    let error = serde_json::from_str::<Envelope>(body)
        .unwrap_or_default()
        .error
        .unwrap_or_default();
    tracing::debug!(status = %status, body = %body, "Gemini API error");
    ProviderError::Rejected {
        provider: PROVIDER_NAME.to_string(),
        status: Some(status.as_u16()),
        code: error.status,
        message: error.message.unwrap_or_default(),
    }
}

#[async_trait]
impl VideoProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        let duration = request.duration_seconds.clamp(1, MAX_DURATION_SECONDS);
        // Veo takes reference images as inline bytes only, so generation is
        // driven by the prompt alone.
        let body = json!({
            "instances": [{ "prompt": request.prompt }],
            "parameters": {
                "aspectRatio": request.aspect_ratio.to_string(),
                "resolution": resolution_param(request.resolution),
                "durationSeconds": duration,
            }
        });

        let url = join_url(&self.base_url, &format!("models/{}:predictLongRunning", self.model));
        tracing::info!(job_id = %request.job_id, model = %self.model, duration, "Submitting Veo generation");

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejection(status, &text));
        }

        let operation: Operation = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Decode(format!("predictLongRunning: {e}")))?;
        let name = operation
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ProviderError::Decode("operation name missing".to_string()))?;

        Ok(GenerationResult {
            provider_job_id: name,
            result_url: operation.video_uri(),
            duration_seconds: duration,
            estimated_duration: Duration::from_secs(60),
        })
    }

    async fn get_progress(&self, provider_job_id: &str) -> Result<Progress, ProviderError> {
        let operation = self.fetch_operation(provider_job_id).await?;
        Ok(map_operation(&operation))
    }

    async fn get_result_url(&self, provider_job_id: &str) -> Result<String, ProviderError> {
        self.fetch_operation(provider_job_id)
            .await?
            .video_uri()
            .ok_or_else(|| ProviderError::NotReady(provider_job_id.to_string()))
    }

    async fn cancel(&self, provider_job_id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(join_url(&self.base_url, &format!("{provider_job_id}:cancel")))
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({}))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_IMPLEMENTED => Err(ProviderError::NotSupported(PROVIDER_NAME.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(rejection(status, &body))
            }
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_duration_seconds: MAX_DURATION_SECONDS,
            max_resolution: Resolution::P1080,
            supported_aspect_ratios: vec![AspectRatio::Landscape, AspectRatio::Portrait],
            estimated_time_seconds: 60,
            quality_tier: QualityTier::Premium,
            cost_per_second: 0.35,
        }
    }

    async fn health_check(&self) -> ProviderHealth {
        let started = Instant::now();
        let result = self
            .http
            .get(join_url(&self.base_url, "models"))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => ProviderHealth {
                healthy: response.status().is_success(),
                response_time_ms,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Gemini health probe failed");
                ProviderHealth::unhealthy(response_time_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> GeminiProvider {
        GeminiProvider::new(
            "g-key".to_string(),
            Some(&server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn operation(value: serde_json::Value) -> Operation {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_operation_mapping() {
        let running = map_operation(&operation(json!({"name": "op/1"})));
        assert_eq!(running.stage, Stage::Processing);

        let done = map_operation(&operation(json!({
            "name": "op/1",
            "done": true,
            "response": {"generateVideoResponse": {"generatedSamples": [{"video": {"uri": "https://files/v.mp4"}}]}}
        })));
        assert_eq!(done.stage, Stage::Completed);
        assert_eq!(done.result_url.as_deref(), Some("https://files/v.mp4"));

        let failed = map_operation(&operation(json!({
            "done": true,
            "error": {"code": 3, "message": "prompt blocked"}
        })));
        assert_eq!(failed.error.as_deref(), Some("prompt blocked"));

        let filtered = map_operation(&operation(json!({
            "done": true,
            "response": {"generateVideoResponse": {"raiMediaFilteredReasons": ["unsafe content"]}}
        })));
        assert_eq!(filtered.stage, Stage::Failed);
        assert_eq!(filtered.error.as_deref(), Some("unsafe content"));
    }

    #[tokio::test]
    async fn test_generate_starts_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{DEFAULT_MODEL}:predictLongRunning")))
            .and(header("x-goog-api-key", "g-key"))
            .and(body_partial_json(json!({"parameters": {"aspectRatio": "9:16", "durationSeconds": 8}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "models/veo/operations/abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = GenerationRequest {
            job_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            prompt: "snow falling on pines".to_string(),
            source_image_url: None,
            duration_seconds: 20,
            resolution: Resolution::P720,
            aspect_ratio: AspectRatio::Portrait,
        };
        let result = provider(&server).generate(&request).await.unwrap();
        assert_eq!(result.provider_job_id, "models/veo/operations/abc");
        assert_eq!(result.duration_seconds, 8);
    }

    #[tokio::test]
    async fn test_quota_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/veo/operations/abc"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "Quota exceeded"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .get_progress("models/veo/operations/abc")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Rejected { status: Some(429), ref code, .. } if code.as_deref() == Some("RESOURCE_EXHAUSTED")
        ));
    }

    #[tokio::test]
    async fn test_cancel_posts_to_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/veo/operations/abc:cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .cancel("models/veo/operations/abc")
            .await
            .unwrap();
    }
}
