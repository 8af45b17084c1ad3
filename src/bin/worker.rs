use tokio_util::sync::CancellationToken;

use video_dispatch::bootstrap;
use video_dispatch::config::AppConfig;
use video_dispatch::services::worker::spawn_pool;
use video_dispatch::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting video dispatch worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let pipeline = bootstrap::build_pipeline(&config)
        .await
        .expect("Failed to initialize pipeline");

    let shutdown = CancellationToken::new();
    let concurrency = config.worker_concurrency.max(1);
    let mut tasks = spawn_pool(
        &pipeline,
        &config.worker_settings(),
        concurrency,
        "worker",
        &shutdown,
    );
    tasks.extend(bootstrap::spawn_maintenance(&pipeline, &config, &shutdown));

    tracing::info!(concurrency, "Worker ready, starting job processing loop");

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received; finishing in-flight jobs");
    shutdown.cancel();

    futures::future::join_all(tasks).await;
    tracing::info!("Worker stopped");
}
