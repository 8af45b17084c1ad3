use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::jobs::JobService;
use crate::services::pipeline::Pipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub jobs: JobService,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, config: AppConfig) -> Self {
        Self {
            jobs: JobService::new(pipeline.clone()),
            pipeline,
            config: Arc::new(config),
        }
    }
}
