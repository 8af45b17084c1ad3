//! Background recovery: expired queue leases and orphaned processing jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::models::job::JobStatus;
use crate::services::pipeline::{Pipeline, SettleError, Terminal};
use crate::services::queue::JobQueue;
use crate::services::worker::TIMEOUT_MESSAGE;

/// Return expired deliveries to the queue every `interval` until shutdown.
pub async fn run_lease_reclaimer(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(interval_ms = interval.as_millis() as u64, "Lease reclaimer started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Lease reclaimer stopped");
                break;
            }
            _ = ticker.tick() => {
                match queue.reclaim_expired().await {
                    Ok(0) => {}
                    Ok(count) => {
                        metrics::counter!("video_queue_reclaimed_total").increment(count);
                        tracing::warn!(count, "Requeued deliveries with expired leases");
                    }
                    Err(e) => tracing::error!(error = %e, "Lease reclaim failed"),
                }
                match queue.depth().await {
                    Ok(depth) => metrics::gauge!("video_queue_depth").set(depth as f64),
                    Err(e) => tracing::debug!(error = %e, "Queue depth unavailable"),
                }
            }
        }
    }
}

/// Finishes processing jobs that have outlived any worker that could own them.
///
/// A redelivered `processing` job is a no-op for workers, so a job whose
/// worker died after accepting it would otherwise stay `processing` forever.
/// Such a job is cancelled when its owner asked for that, and failed as
/// timed out otherwise.
pub struct StaleJobSweeper {
    pipeline: Pipeline,
    stale_after: Duration,
}

impl StaleJobSweeper {
    pub fn new(pipeline: Pipeline, stale_after: Duration) -> Self {
        Self {
            pipeline,
            stale_after,
        }
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            stale_after_secs = self.stale_after.as_secs(),
            "Stale job sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Stale job sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Stale job sweep failed");
                    }
                }
            }
        }
    }

    /// One pass. Returns how many jobs were recovered.
    pub async fn sweep_once(&self) -> Result<usize, SettleError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::days(1));
        let processing = self
            .pipeline
            .store
            .list_by_status(Some(JobStatus::Processing), None)
            .await?;

        let mut recovered = 0;
        for job in processing {
            let stale = job.started_at.map_or(true, |started| started < cutoff);
            if !stale {
                continue;
            }

            let job_id = job.id;
            let started_at = job.started_at;
            let terminal = if self.cancel_requested(job_id).await {
                Terminal::Cancelled
            } else {
                Terminal::Failed(TIMEOUT_MESSAGE.to_string())
            };
            if let Some(settled) = self.pipeline.settle(job, terminal).await? {
                recovered += 1;
                metrics::counter!("video_stale_jobs_recovered_total").increment(1);
                tracing::warn!(
                    job_id = %job_id,
                    started_at = ?started_at,
                    status = %settled.status,
                    "Recovered stale processing job"
                );
            }
        }
        Ok(recovered)
    }

    /// An unreadable cancel flag is treated as unset.
    async fn cancel_requested(&self, job_id: uuid::Uuid) -> bool {
        match self.pipeline.queue.is_cancel_requested(job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Cancel flag unavailable during sweep");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::db::store::{InMemoryJobStore, JobStore};
    use crate::models::job::{GenerationParams, NewVideoJob, VideoJob, CANCELLED_MESSAGE};
    use crate::services::credits::{CreditLedger, InMemoryCreditLedger};
    use crate::services::hub::NotificationHub;
    use crate::services::provider_health::HealthMonitor;
    use crate::services::queue::InMemoryJobQueue;
    use crate::services::registry::ProviderRegistry;
    use crate::services::retry::RetryConfig;
    use crate::services::selector::ProviderSelector;

    async fn processing_job(store: &InMemoryJobStore, started_ago: chrono::Duration) -> VideoJob {
        let mut job = VideoJob::new(NewVideoJob {
            owner_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            prompt: "glacier calving".to_string(),
            params: GenerationParams::default(),
            credits_charged: 5,
        });
        let started = Utc::now() - started_ago;
        job.claim("dead-worker", started, started).unwrap();
        job.mark_processing("mock", "task-1").unwrap();
        store.create(&job).await.unwrap();
        job
    }

    struct Fixture {
        pipeline: Pipeline,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryJobQueue>,
        ledger: Arc<InMemoryCreditLedger>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(30)));
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let pipeline = Pipeline {
            store: store.clone(),
            queue: queue.clone(),
            ledger: ledger.clone(),
            selector: Arc::new(ProviderSelector::new(
                Arc::new(ProviderRegistry::new()),
                Arc::new(HealthMonitor::new(Duration::from_secs(30), Duration::from_secs(1))),
            )),
            hub: Arc::new(NotificationHub::new(8)),
            retry: RetryConfig::default(),
        };
        Fixture {
            pipeline,
            store,
            queue,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_sweeps_only_stale_jobs() {
        let Fixture {
            pipeline,
            store,
            ledger,
            ..
        } = fixture();

        let old = processing_job(&store, chrono::Duration::hours(2)).await;
        let fresh = processing_job(&store, chrono::Duration::seconds(10)).await;

        let sweeper = StaleJobSweeper::new(pipeline, Duration::from_secs(1_020));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

        let swept = store.get_by_id(old.id).await.unwrap();
        assert_eq!(swept.status, JobStatus::Failed);
        assert_eq!(swept.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert!(swept.credits_refunded);
        assert_eq!(ledger.balance(old.owner_id).await.unwrap(), 5);

        assert_eq!(store.get_by_id(fresh.id).await.unwrap().status, JobStatus::Processing);
        // A second pass finds nothing new.
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_job_with_cancel_request_is_cancelled() {
        let fx = fixture();
        let job = processing_job(&fx.store, chrono::Duration::hours(2)).await;
        fx.queue.request_cancel(job.id).await.unwrap();

        let sweeper = StaleJobSweeper::new(fx.pipeline.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

        let swept = fx.store.get_by_id(job.id).await.unwrap();
        assert_eq!(swept.status, JobStatus::Cancelled);
        assert_eq!(swept.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(swept.credits_refunded);
        assert_eq!(fx.ledger.balance(job.owner_id).await.unwrap(), 5);
        assert!(!fx.queue.is_cancel_requested(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaimer_stops_on_shutdown() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(Duration::from_millis(5)));
        queue.enqueue(Uuid::new_v4()).await.unwrap();
        queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_lease_reclaimer(
            queue.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
