//! Process wiring shared by the API server and the worker binary.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::credit_queries::PgCreditLedger;
use crate::db::queries::PgJobStore;
use crate::db;
use crate::services::hub::NotificationHub;
use crate::services::pipeline::Pipeline;
use crate::services::provider_health::HealthMonitor;
use crate::services::providers::ProviderError;
use crate::services::queue::{QueueError, RedisJobQueue};
use crate::services::reaper::{run_lease_reclaimer, StaleJobSweeper};
use crate::services::registry::ProviderRegistry;
use crate::services::selector::ProviderSelector;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Connect to Postgres and Redis, run migrations, and register providers.
pub async fn build_pipeline(config: &AppConfig) -> Result<Pipeline, BootstrapError> {
    tracing::info!("Connecting to PostgreSQL database");
    let pool = db::init_pool(&config.database_url).await?;

    tracing::info!("Running database migrations");
    db::run_migrations(&pool).await?;

    tracing::info!(namespace = %config.queue_namespace, "Connecting to Redis job queue");
    let queue = RedisJobQueue::new(&config.redis_url, &config.queue_namespace, config.lease())?;

    let registry = ProviderRegistry::from_config(config)?;

    let health = HealthMonitor::new(config.health_ttl(), config.health_timeout());
    Ok(Pipeline {
        store: Arc::new(PgJobStore::new(pool.clone())),
        queue: Arc::new(queue),
        ledger: Arc::new(PgCreditLedger::new(pool)),
        selector: Arc::new(ProviderSelector::new(Arc::new(registry), Arc::new(health))),
        hub: Arc::new(NotificationHub::new(config.hub_buffer)),
        retry: config.worker_settings().retry,
    })
}

/// Start the lease reclaimer and the stale job sweeper.
pub fn spawn_maintenance(
    pipeline: &Pipeline,
    config: &AppConfig,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let reclaim_every = (config.lease() / 2).max(std::time::Duration::from_secs(1));
    let sweeper = StaleJobSweeper::new(pipeline.clone(), config.stale_after());
    vec![
        tokio::spawn(run_lease_reclaimer(
            pipeline.queue.clone(),
            reclaim_every,
            shutdown.clone(),
        )),
        tokio::spawn(sweeper.run(config.stale_sweep_interval(), shutdown.clone())),
    ]
}
