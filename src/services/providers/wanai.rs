//! Wan AI image-to-video through Alibaba Cloud DashScope.
//!
//! DashScope runs generation as an async task: the synthesis call returns a
//! task id, and `GET /tasks/{id}` reports its status until it succeeds or
//! fails. There is no cancellation endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::models::generation::{
    GenerationRequest, GenerationResult, Progress, ProviderCapabilities, ProviderHealth,
    QualityTier, Stage, UNKNOWN_STATUS_PERCENT,
};
use crate::models::job::{AspectRatio, Resolution};
use crate::services::providers::{join_url, ProviderError, VideoProvider};

pub const PROVIDER_NAME: &str = "wanai";

/// Singapore region. The Beijing region uses `dashscope.aliyuncs.com`.
pub const DEFAULT_BASE_URL: &str = "https://dashscope-intl.aliyuncs.com/compatible-mode/v1";

pub const DEFAULT_VERSION: &str = "2.5";

const MODEL: &str = "wan2.6-i2v";

/// Used when neither the request nor its template supplies a source image.
pub const DEMO_IMAGE_URL: &str = "https://cdn.translate.alibaba.com/r/wanx-demo-1.png";

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    model: &'a str,
    input: SynthesisInput<'a>,
    parameters: SynthesisParameters,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    prompt: &'a str,
    img_url: &'a str,
}

#[derive(Serialize)]
struct SynthesisParameters {
    resolution: &'static str,
    duration: u32,
    prompt_extend: bool,
    watermark: bool,
    audio: bool,
    shot_type: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct TaskResponse {
    #[serde(default)]
    output: TaskOutput,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskOutput {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    task_status: Option<String>,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    video: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl TaskResponse {
    /// Top-level error code, if the call itself was refused.
    fn api_error(&self) -> Option<&str> {
        non_empty(&self.code).filter(|code| *code != "Success")
    }

    fn video_url(&self) -> Option<String> {
        non_empty(&self.output.video_url)
            .or_else(|| non_empty(&self.output.video))
            .map(str::to_string)
    }

    /// First non-empty failure reason, checked in the order DashScope fills
    /// them in.
    fn failure_cause(&self) -> Option<String> {
        [
            &self.message,
            &self.output.message,
            &self.output.code,
            &self.code,
        ]
        .into_iter()
        .find_map(non_empty)
        .map(str::to_string)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Map a task status onto the canonical progress scale. Status strings are
/// matched case-insensitively; unknown ones count as in progress.
fn map_task(task: &TaskResponse) -> Progress {
    let status = task
        .output
        .task_status
        .as_deref()
        .unwrap_or_default()
        .to_ascii_uppercase();

    match status.as_str() {
        "SUCCEEDED" => Progress::completed(task.video_url()),
        "RUNNING" | "PROCESSING" => Progress::at(Stage::Processing, "Video generation in progress"),
        "PENDING" | "QUEUED" => Progress::at(Stage::Queued, "Video generation queued"),
        "FAILED" | "ERROR" => Progress::failed(task.failure_cause()),
        other => Progress {
            percent: UNKNOWN_STATUS_PERCENT,
            ..Progress::at(Stage::Processing, format!("Video generation: {other}"))
        },
    }
}

/// DashScope's async task API lives under `api/v1`, not the OpenAI-compatible
/// prefix most configs point at.
fn task_api_base(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match base.strip_suffix("/compatible-mode/v1") {
        Some(host) => format!("{host}/api/v1"),
        None => base.to_string(),
    }
}

/// Wan accepts 5, 10 or 15 second clips.
fn normalize_duration(seconds: u32) -> u32 {
    match seconds {
        0..=7 => 5,
        8..=12 => 10,
        _ => 15,
    }
}

fn normalize_resolution(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::P480 => "480P",
        Resolution::P1080 => "1080P",
        Resolution::P720 | Resolution::K4 => "720P",
    }
}

/// Rough wall-clock time DashScope needs per resolution.
fn estimated_duration(resolution: &str) -> Duration {
    match resolution {
        "480P" => Duration::from_secs(150),
        "1080P" => Duration::from_secs(450),
        _ => Duration::from_secs(240),
    }
}

pub struct WanAiProvider {
    http: Client,
    api_key: String,
    api_base: String,
    version: String,
}

impl WanAiProvider {
    pub fn new(
        api_key: String,
        base_url: Option<&str>,
        version: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            api_key,
            api_base: task_api_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
            version: version.unwrap_or(DEFAULT_VERSION).to_string(),
        })
    }

    async fn fetch_task(&self, task_id: &str) -> Result<TaskResponse, ProviderError> {
        let url = join_url(&self.api_base, &format!("tasks/{task_id}"));
        let response = self.http.get(&url).bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::debug!(task_id = %task_id, status = %status, body = %body, "DashScope status check error");
            return Err(rejection(status, &body));
        }

        let task: TaskResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("task response: {e}")))?;
        tracing::debug!(task_id = %task_id, body = %body, "DashScope task response");
        Ok(task)
    }
}

fn rejection(status: StatusCode, body: &str) -> ProviderError {
    let parsed: TaskResponse = serde_json::from_str(body).unwrap_or_default();
    ProviderError::Rejected {
        provider: PROVIDER_NAME.to_string(),
        status: Some(status.as_u16()),
        code: non_empty(&parsed.code).map(str::to_string),
        message: non_empty(&parsed.message).unwrap_or_default().to_string(),
    }
}

#[async_trait]
impl VideoProvider for WanAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        let duration = normalize_duration(request.duration_seconds);
        let resolution = normalize_resolution(request.resolution);
        let image_url = request
            .source_image_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(DEMO_IMAGE_URL);

        let body = SynthesisRequest {
            model: MODEL,
            input: SynthesisInput {
                prompt: &request.prompt,
                img_url: image_url,
            },
            parameters: SynthesisParameters {
                resolution,
                duration,
                prompt_extend: false,
                watermark: false,
                audio: true,
                shot_type: "single",
            },
        };

        let url = join_url(&self.api_base, "services/aigc/video-generation/video-synthesis");
        tracing::info!(
            job_id = %request.job_id,
            model = MODEL,
            version = %self.version,
            resolution,
            duration,
            "Submitting DashScope image-to-video task"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-DashScope-Async", "enable")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::warn!(job_id = %request.job_id, status = %status, body = %text, "DashScope rejected task");
            return Err(rejection(status, &text));
        }

        let task: TaskResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Decode(format!("synthesis response: {e}")))?;

        if let Some(code) = task.api_error() {
            return Err(ProviderError::Rejected {
                provider: PROVIDER_NAME.to_string(),
                status: Some(status.as_u16()),
                code: Some(code.to_string()),
                message: non_empty(&task.message).unwrap_or_default().to_string(),
            });
        }

        let task_id = non_empty(&task.output.task_id)
            .ok_or_else(|| ProviderError::Decode("synthesis response missing task_id".to_string()))?
            .to_string();

        Ok(GenerationResult {
            provider_job_id: task_id,
            result_url: task.video_url(),
            duration_seconds: duration,
            estimated_duration: estimated_duration(resolution),
        })
    }

    async fn get_progress(&self, provider_job_id: &str) -> Result<Progress, ProviderError> {
        let task = self.fetch_task(provider_job_id).await?;

        // A task status, when present, carries the outcome even if the
        // envelope also has an error code.
        if task.output.task_status.is_none() {
            if let Some(code) = task.api_error() {
                return Err(ProviderError::Rejected {
                    provider: PROVIDER_NAME.to_string(),
                    status: None,
                    code: Some(code.to_string()),
                    message: non_empty(&task.message).unwrap_or_default().to_string(),
                });
            }
        }

        let progress = map_task(&task);
        if progress.percent == UNKNOWN_STATUS_PERCENT {
            tracing::warn!(
                task_id = %provider_job_id,
                status = ?task.output.task_status,
                "Unknown DashScope task status"
            );
        }
        Ok(progress)
    }

    async fn get_result_url(&self, provider_job_id: &str) -> Result<String, ProviderError> {
        self.fetch_task(provider_job_id)
            .await?
            .video_url()
            .ok_or_else(|| ProviderError::NotReady(provider_job_id.to_string()))
    }

    async fn cancel(&self, provider_job_id: &str) -> Result<(), ProviderError> {
        tracing::debug!(task_id = %provider_job_id, "DashScope has no cancel endpoint");
        Err(ProviderError::NotSupported(PROVIDER_NAME.to_string()))
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_duration_seconds: 15,
            max_resolution: Resolution::P1080,
            supported_aspect_ratios: vec![
                AspectRatio::Landscape,
                AspectRatio::Portrait,
                AspectRatio::Square,
            ],
            estimated_time_seconds: 20,
            quality_tier: QualityTier::Premium,
            cost_per_second: 0.03,
        }
    }

    async fn health_check(&self) -> ProviderHealth {
        let started = Instant::now();
        let result = self
            .http
            .get(join_url(&self.api_base, "models"))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            // 401 still proves the API is reachable.
            Ok(response) => ProviderHealth {
                healthy: matches!(response.status(), StatusCode::OK | StatusCode::UNAUTHORIZED),
                response_time_ms,
            },
            Err(e) => {
                tracing::warn!(error = %e, "DashScope health probe failed");
                ProviderHealth::unhealthy(response_time_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(value: serde_json::Value) -> TaskResponse {
        serde_json::from_value(value).unwrap()
    }

    fn provider(server: &MockServer) -> WanAiProvider {
        WanAiProvider::new(
            "sk-test".to_string(),
            Some(&server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request(duration: u32, resolution: Resolution) -> GenerationRequest {
        GenerationRequest {
            job_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            prompt: "a paper boat on a river".to_string(),
            source_image_url: None,
            duration_seconds: duration,
            resolution,
            aspect_ratio: AspectRatio::Landscape,
        }
    }

    #[test]
    fn test_status_mapping_is_case_insensitive() {
        let running = map_task(&task(json!({"output": {"task_status": "running"}})));
        assert_eq!(running.percent, 50);
        let queued = map_task(&task(json!({"output": {"task_status": "QUEUED"}})));
        assert_eq!(queued.stage, Stage::Queued);
        assert_eq!(queued.percent, 10);
        let done = map_task(&task(
            json!({"output": {"task_status": "Succeeded", "video": "https://oss/v.mp4"}}),
        ));
        assert_eq!(done.percent, 100);
        assert_eq!(done.result_url.as_deref(), Some("https://oss/v.mp4"));
    }

    #[test]
    fn test_unknown_status_is_in_progress() {
        let progress = map_task(&task(json!({"output": {"task_status": "SUSPENDED"}})));
        assert_eq!(progress.percent, UNKNOWN_STATUS_PERCENT);
        assert_eq!(progress.stage, Stage::Processing);
        assert!(!progress.is_terminal());
    }

    #[test]
    fn test_failure_cause_precedence() {
        let all = task(json!({
            "message": "top message",
            "code": "TopCode",
            "output": {"task_status": "FAILED", "message": "output message", "code": "OutCode"}
        }));
        assert_eq!(all.failure_cause().as_deref(), Some("top message"));

        let output_only = task(json!({
            "code": "TopCode",
            "output": {"task_status": "FAILED", "message": "output message", "code": "OutCode"}
        }));
        assert_eq!(output_only.failure_cause().as_deref(), Some("output message"));

        let codes = task(json!({"code": "TopCode", "output": {"task_status": "FAILED", "code": "OutCode"}}));
        assert_eq!(codes.failure_cause().as_deref(), Some("OutCode"));

        let top_code = task(json!({"code": "TopCode", "output": {"task_status": "ERROR"}}));
        assert_eq!(top_code.failure_cause().as_deref(), Some("TopCode"));
    }

    #[test]
    fn test_error_without_any_cause() {
        let progress = map_task(&task(json!({"output": {"task_status": "ERROR", "message": "  "}})));
        assert_eq!(progress.stage, Stage::Failed);
        assert_eq!(progress.percent, 0);
        assert!(progress.error.is_none());
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_duration(1), 5);
        assert_eq!(normalize_duration(7), 5);
        assert_eq!(normalize_duration(8), 10);
        assert_eq!(normalize_duration(12), 10);
        assert_eq!(normalize_duration(60), 15);
        assert_eq!(normalize_resolution(Resolution::P480), "480P");
        assert_eq!(normalize_resolution(Resolution::K4), "720P");
        assert_eq!(
            task_api_base("https://dashscope.aliyuncs.com/compatible-mode/v1/"),
            "https://dashscope.aliyuncs.com/api/v1"
        );
        assert_eq!(task_api_base("http://127.0.0.1:9000"), "http://127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_generate_submits_async_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/aigc/video-generation/video-synthesis"))
            .and(header("X-DashScope-Async", "enable"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "wan2.6-i2v",
                "input": {"img_url": DEMO_IMAGE_URL},
                "parameters": {"resolution": "1080P", "duration": 10}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "request_id": "r-1",
                "output": {"task_id": "task-42", "task_status": "PENDING"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server)
            .generate(&request(9, Resolution::P1080))
            .await
            .unwrap();
        assert_eq!(result.provider_job_id, "task-42");
        assert_eq!(result.duration_seconds, 10);
        assert!(result.result_url.is_none());
    }

    #[tokio::test]
    async fn test_generate_rejection_carries_vendor_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/aigc/video-generation/video-synthesis"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": "InvalidParameter",
                "message": "url error, please check url"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .generate(&request(5, Resolution::P720))
            .await
            .unwrap_err();
        match err {
            ProviderError::Rejected { status, code, message, .. } => {
                assert_eq!(status, Some(400));
                assert_eq!(code.as_deref(), Some("InvalidParameter"));
                assert_eq!(message, "url error, please check url");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_error_status_without_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/task-7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": {"task_id": "task-7", "task_status": "ERROR"}})),
            )
            .mount(&server)
            .await;

        let progress = provider(&server).get_progress("task-7").await.unwrap();
        assert_eq!(progress.stage, Stage::Failed);
        assert!(progress.error.is_none());
    }

    #[tokio::test]
    async fn test_result_url_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/task-8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": {"task_id": "task-8", "task_status": "RUNNING"}})),
            )
            .mount(&server)
            .await;

        let err = provider(&server).get_result_url("task-8").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_health_treats_unauthorized_as_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(provider(&server).health_check().await.healthy);
    }

    #[tokio::test]
    async fn test_cancel_not_supported() {
        let server = MockServer::start().await;
        let err = provider(&server).cancel("task-1").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotSupported(_)));
    }
}
