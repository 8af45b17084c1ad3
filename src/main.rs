use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use video_dispatch::app_state::AppState;
use video_dispatch::bootstrap;
use video_dispatch::config::AppConfig;
use video_dispatch::routes;
use video_dispatch::services::worker::spawn_pool;
use video_dispatch::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing video-dispatch server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    telemetry::describe_metrics();

    let pipeline = bootstrap::build_pipeline(&config)
        .await
        .expect("Failed to initialize pipeline");

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    if config.embedded_workers > 0 {
        tracing::info!(workers = config.embedded_workers, "Starting embedded dispatch workers");
        tasks.extend(spawn_pool(
            &pipeline,
            &config.worker_settings(),
            config.embedded_workers,
            "api",
            &shutdown,
        ));
        tasks.extend(bootstrap::spawn_maintenance(&pipeline, &config, &shutdown));
    }

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(pipeline, config);
    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    futures::future::join_all(tasks).await;
    tracing::info!("Server stopped");
}
