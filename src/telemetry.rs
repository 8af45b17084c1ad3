use tracing_subscriber::EnvFilter;

/// Install the JSON `tracing` subscriber. Level comes from `RUST_LOG`,
/// defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for the metrics the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!("video_jobs_submitted_total", "Video jobs accepted and enqueued");
    metrics::describe_counter!("video_jobs_completed_total", "Video jobs that produced a result");
    metrics::describe_counter!("video_jobs_failed_total", "Video jobs that ended in failure");
    metrics::describe_counter!("video_jobs_cancelled_total", "Video jobs cancelled by their owner");
    metrics::describe_counter!("video_credit_refunds_total", "Credit refunds issued for failed or cancelled jobs");
    metrics::describe_counter!(
        "video_hub_dropped_events_total",
        "Progress events discarded for slow or disconnected subscribers"
    );
    metrics::describe_counter!("video_queue_reclaimed_total", "Queue deliveries requeued after their lease expired");
    metrics::describe_counter!(
        "video_stale_jobs_recovered_total",
        "Processing jobs failed by the stale job sweeper"
    );
    metrics::describe_histogram!(
        "video_generation_seconds",
        metrics::Unit::Seconds,
        "Time from provider submission to completed video"
    );
    metrics::describe_gauge!("video_queue_depth", "Job identifiers waiting in the queue");
}
