use std::time::Duration;

use serde::Deserialize;

use crate::services::worker::WorkerSettings;

/// Process configuration, read once from the environment at start-up.
///
/// Environment variable names are the upper-cased field names
/// (`DATABASE_URL`, `WANAI_API_KEY`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address. Ignored by the worker process.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Prefix for every Redis key the queue touches
    #[serde(default = "default_queue_namespace")]
    pub queue_namespace: String,

    /// Register the in-memory mock provider
    #[serde(default)]
    pub use_mock_provider: bool,

    /// DashScope API key. The Wan provider is registered only when set.
    #[serde(default)]
    pub wanai_api_key: Option<String>,
    #[serde(default)]
    pub wanai_base_url: Option<String>,
    #[serde(default)]
    pub wanai_version: Option<String>,

    /// Gemini API key. The Veo provider is registered only when set.
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub gemini_base_url: Option<String>,
    #[serde(default)]
    pub gemini_model: Option<String>,

    /// Concurrent jobs per worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Workers started inside the API process, so its notification hub sees
    /// their events. Zero leaves all processing to `bin/worker`.
    #[serde(default = "default_embedded_workers")]
    pub embedded_workers: usize,

    #[serde(default = "default_poll_interval_min_ms")]
    pub poll_interval_min_ms: u64,
    #[serde(default = "default_poll_interval_max_ms")]
    pub poll_interval_max_ms: u64,

    /// Wall-clock budget for one job's poll loop
    #[serde(default = "default_max_generation_secs")]
    pub max_generation_secs: u64,

    /// Queue lease and job claim length
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_health_ttl_secs")]
    pub health_ttl_secs: u64,

    /// Consecutive poll failures tolerated before a job is failed
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,

    #[serde(default = "default_stale_sweep_secs")]
    pub stale_sweep_secs: u64,

    /// Per-connection event buffer in the notification hub
    #[serde(default = "default_hub_buffer")]
    pub hub_buffer: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_queue_namespace() -> String {
    "video_gen".to_string()
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_embedded_workers() -> usize {
    2
}

fn default_poll_interval_min_ms() -> u64 {
    1_000
}

fn default_poll_interval_max_ms() -> u64 {
    5_000
}

fn default_max_generation_secs() -> u64 {
    900
}

fn default_lease_secs() -> u64 {
    120
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_health_timeout_ms() -> u64 {
    3_000
}

fn default_health_ttl_secs() -> u64 {
    30
}

fn default_max_poll_errors() -> u32 {
    3
}

fn default_stale_sweep_secs() -> u64 {
    60
}

fn default_hub_buffer() -> usize {
    64
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(1))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms.max(1))
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_secs.max(1))
    }

    /// A processing job older than this has outlived any worker that could
    /// still own it.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.max_generation_secs + self.lease_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let poll_min = Duration::from_millis(self.poll_interval_min_ms.max(1));
        WorkerSettings {
            poll_interval_min: poll_min,
            poll_interval_max: Duration::from_millis(self.poll_interval_max_ms).max(poll_min),
            max_generation_time: Duration::from_secs(self.max_generation_secs),
            lease: self.lease(),
            provider_timeout: self.provider_timeout(),
            max_poll_errors: self.max_poll_errors,
            ..WorkerSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> AppConfig {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/video"),
            ("REDIS_URL", "redis://localhost"),
        ]);
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.queue_namespace, "video_gen");
        assert!(!config.use_mock_provider);
        assert!(config.wanai_api_key.is_none());
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.stale_after(), Duration::from_secs(1_020));

        let settings = config.worker_settings();
        assert_eq!(settings.poll_interval_min, Duration::from_secs(1));
        assert_eq!(settings.poll_interval_max, Duration::from_secs(5));
        assert_eq!(settings.max_poll_errors, 3);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/video"),
            ("REDIS_URL", "redis://localhost"),
            ("USE_MOCK_PROVIDER", "true"),
            ("WANAI_API_KEY", "sk-123"),
            ("POLL_INTERVAL_MIN_MS", "2000"),
            ("POLL_INTERVAL_MAX_MS", "500"),
        ]);
        assert!(config.use_mock_provider);
        assert_eq!(config.wanai_api_key.as_deref(), Some("sk-123"));
        // The upper bound never drops below the lower one.
        let settings = config.worker_settings();
        assert_eq!(settings.poll_interval_max, Duration::from_secs(2));
    }
}
