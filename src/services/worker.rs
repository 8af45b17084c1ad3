//! Dispatch worker: owns a job from delivery to a terminal state.
//!
//! One delivery runs through claim, provider selection, `generate`, and a
//! bounded poll loop. Provider failures always end in a terminal job state.
//! Store and queue failures are retried with backoff; once retries run out
//! the attempt is abandoned unacked so the lease expires and the job is
//! redelivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::StoreError;
use crate::models::event::JobEvent;
use crate::models::generation::{GenerationRequest, Progress, Stage};
use crate::models::job::{InvalidTransition, JobStatus, VideoJob, UNKNOWN_FAILURE_MESSAGE};
use crate::services::credits::CreditError;
use crate::services::pipeline::{Pipeline, SettleError, Terminal};
use crate::services::providers::{with_timeout, ProviderError, VideoProvider};
use crate::services::queue::{Delivery, QueueError};
use crate::services::retry::{with_retry, RetryConfig};
use crate::services::selector::SelectionError;

pub const TIMEOUT_MESSAGE: &str = "Video generation timed out";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval_min: Duration,
    pub poll_interval_max: Duration,
    /// Wall-clock budget for one job's poll loop.
    pub max_generation_time: Duration,
    /// Queue lease and job claim length.
    pub lease: Duration,
    pub provider_timeout: Duration,
    /// Consecutive failed polls tolerated before the job is failed.
    pub max_poll_errors: u32,
    /// How long one dequeue blocks before the loop re-checks shutdown.
    pub dequeue_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_min: Duration::from_secs(1),
            poll_interval_max: Duration::from_secs(5),
            max_generation_time: Duration::from_secs(900),
            lease: Duration::from_secs(120),
            provider_timeout: Duration::from_secs(30),
            max_poll_errors: 3,
            dequeue_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerSettings {
    /// A tenth of the expected generation time, kept within the configured
    /// bounds.
    pub fn poll_interval(&self, estimated: Duration) -> Duration {
        (estimated / 10).clamp(self.poll_interval_min, self.poll_interval_max)
    }
}

/// Failures seen by the worker, in the pipeline's error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("Video generation exceeded its {0:?} budget")]
    TimeoutExceeded(Duration),

    #[error("{count} consecutive progress checks failed: {last}")]
    PollFailures { count: u32, last: ProviderError },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl From<SettleError> for DispatchError {
    fn from(e: SettleError) -> Self {
        match e {
            SettleError::Store(e) => Self::Store(e),
            SettleError::Credit(e) => Self::Credit(e),
            SettleError::Transition(e) => Self::Transition(e),
        }
    }
}

impl DispatchError {
    /// Normalized `error_message` recorded on the job.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(e) => e.user_message(),
            Self::PollFailures { last, .. } => last.user_message(),
            Self::Selection(_) => "No video provider is available for this request".to_string(),
            Self::TimeoutExceeded(_) => TIMEOUT_MESSAGE.to_string(),
            Self::Store(_) | Self::Queue(_) | Self::Credit(_) | Self::Transition(_) => {
                UNKNOWN_FAILURE_MESSAGE.to_string()
            }
        }
    }

    /// Infrastructure failures abandon the attempt for redelivery instead of
    /// settling the job.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Queue(_) | Self::Credit(_))
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
    /// Nothing to do: duplicate delivery or missing record. The delivery is
    /// acked.
    Skipped(&'static str),
    /// Left unacked so the lease expires and the job is redelivered: the
    /// attempt was abandoned, or another worker's claim is still live.
    Deferred(&'static str),
}

pub struct DispatchWorker {
    id: String,
    pipeline: Pipeline,
    settings: WorkerSettings,
}

impl DispatchWorker {
    pub fn new(id: impl Into<String>, pipeline: Pipeline, settings: WorkerSettings) -> Self {
        Self {
            id: id.into(),
            pipeline,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consume deliveries until `shutdown` fires. A job in flight when
    /// shutdown is requested runs to completion first.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.id, "Dispatch worker started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.pipeline.queue.dequeue(self.settings.dequeue_timeout) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {
                    tracing::trace!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Dequeue failed, backing off");
                    tokio::time::sleep(self.settings.poll_interval_max).await;
                }
            }
        }
        tracing::info!(worker_id = %self.id, "Dispatch worker stopped");
    }

    /// Take at most one delivery and process it. Returns `None` when the
    /// queue stayed empty for `timeout`.
    pub async fn process_next(&self, timeout: Duration) -> Result<Option<Outcome>, QueueError> {
        match self.pipeline.queue.dequeue(timeout).await? {
            Some(delivery) => Ok(Some(self.handle(delivery).await)),
            None => Ok(None),
        }
    }

    async fn handle(&self, delivery: Delivery) -> Outcome {
        let job_id = delivery.job_id;
        let outcome = match self.process(&delivery).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_infrastructure() => {
                tracing::error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Abandoning attempt for redelivery"
                );
                Outcome::Deferred("abandoned")
            }
            Err(e) => {
                tracing::error!(worker_id = %self.id, job_id = %job_id, error = %e, "Job attempt failed");
                Outcome::Skipped("invalid transition")
            }
        };

        if let Outcome::Deferred(reason) = outcome {
            tracing::info!(worker_id = %self.id, job_id = %job_id, reason, "Delivery left for redelivery");
            return outcome;
        }

        if let Err(e) = with_retry(&self.settings.retry, "ack_delivery", || {
            self.pipeline.queue.ack(&delivery)
        })
        .await
        {
            // The lease will expire and the redelivery is a no-op.
            tracing::warn!(job_id = %job_id, error = %e, "Failed to ack delivery");
        }
        if let Outcome::Skipped(reason) = outcome {
            tracing::info!(worker_id = %self.id, job_id = %job_id, reason, "Delivery skipped");
        }
        outcome
    }

    async fn process(&self, delivery: &Delivery) -> Result<Outcome, DispatchError> {
        let job_id = delivery.job_id;
        let job = match with_retry(&self.settings.retry, "load_job", || {
            self.pipeline.store.get_by_id(job_id)
        })
        .await
        {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(Outcome::Skipped("job not found")),
            Err(e) => return Err(e.into()),
        };

        // Idempotence guard for duplicate deliveries.
        if job.is_terminal() {
            return Ok(Outcome::Skipped("already finished"));
        }
        if job.status == JobStatus::Processing {
            return Ok(Outcome::Skipped("already processing"));
        }
        let now = Utc::now();
        if job.claimed_by_other(&self.id, now) {
            return Ok(Outcome::Deferred("claimed by another worker"));
        }

        if self.cancel_requested(job_id).await? {
            return self.finish(job, Terminal::Cancelled).await;
        }

        let mut claimed = job.clone();
        claimed.claim(&self.id, now + lease_chrono(self.settings.lease), now)?;
        let job = match self.pipeline.store.update(&claimed).await {
            Ok(job) => job,
            Err(StoreError::Conflict { .. }) => return Ok(Outcome::Skipped("lost claim race")),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(worker_id = %self.id, job_id = %job.id, "Job claimed");

        let request = GenerationRequest::from_job(&job);
        let preferred = job.params.preferred_provider.clone();
        let provider = match self
            .pipeline
            .selector
            .select(&request, preferred.as_deref())
            .await
        {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Provider selection failed");
                let message = DispatchError::from(e).user_message();
                return self.finish(job, Terminal::Failed(message)).await;
            }
        };

        let started = Instant::now();
        let generation = match with_timeout(self.settings.provider_timeout, provider.generate(&request)).await {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    provider = provider.name(),
                    error = %e,
                    "Provider rejected generation"
                );
                self.pipeline.selector.health().record_outcome(provider.name(), false).await;
                let message = DispatchError::from(e).user_message();
                return self.finish(job, Terminal::Failed(message)).await;
            }
        };

        let mut accepted = job.clone();
        accepted.mark_processing(provider.name(), &generation.provider_job_id)?;
        accepted.advance_progress(Stage::Queued.percent());
        let job = self.save(&accepted).await?;
        tracing::info!(
            job_id = %job.id,
            provider = provider.name(),
            provider_job_id = %generation.provider_job_id,
            "Generation started"
        );
        self.publish(&JobEvent::from_job(&job)).await;

        if let Some(url) = generation.result_url.clone() {
            return self
                .complete(job, provider.as_ref(), url, Some(generation.duration_seconds), started)
                .await;
        }

        let interval = self.settings.poll_interval(generation.estimated_duration);
        self.poll(job, provider, delivery, interval, generation.duration_seconds, started)
            .await
    }

    async fn poll(
        &self,
        mut job: VideoJob,
        provider: Arc<dyn VideoProvider>,
        delivery: &Delivery,
        interval: Duration,
        duration_seconds: u32,
        started: Instant,
    ) -> Result<Outcome, DispatchError> {
        let provider_job_id = job.provider_job_id.clone().unwrap_or_default();
        let deadline = started + self.settings.max_generation_time;
        let mut lease_renewed = Instant::now();
        let mut last_stage = Stage::Queued;
        let mut poll_errors = 0u32;

        loop {
            tokio::time::sleep(interval).await;

            if Instant::now() >= deadline {
                tracing::warn!(job_id = %job.id, provider = provider.name(), "Generation budget exhausted");
                self.cancel_upstream(provider.as_ref(), &provider_job_id).await;
                self.pipeline.selector.health().record_outcome(provider.name(), false).await;
                let message = DispatchError::TimeoutExceeded(self.settings.max_generation_time).user_message();
                return self.finish(job, Terminal::Failed(message)).await;
            }

            if lease_renewed.elapsed() >= self.settings.lease / 2 {
                self.renew_lease(delivery).await;
                lease_renewed = Instant::now();
            }

            let progress = match with_timeout(
                self.settings.provider_timeout,
                provider.get_progress(&provider_job_id),
            )
            .await
            {
                Ok(progress) => {
                    poll_errors = 0;
                    progress
                }
                Err(e) => {
                    poll_errors += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        provider = provider.name(),
                        attempt = poll_errors,
                        error = %e,
                        "Progress check failed"
                    );
                    if poll_errors > self.settings.max_poll_errors {
                        self.pipeline.selector.health().record_outcome(provider.name(), false).await;
                        let message = DispatchError::PollFailures {
                            count: poll_errors,
                            last: e,
                        }
                        .user_message();
                        return self.finish(job, Terminal::Failed(message)).await;
                    }
                    continue;
                }
            };

            match progress.stage {
                Stage::Completed => {
                    let url = match progress.result_url.clone() {
                        Some(url) => url,
                        None => match with_timeout(
                            self.settings.provider_timeout,
                            provider.get_result_url(&provider_job_id),
                        )
                        .await
                        {
                            Ok(url) => url,
                            Err(e) => {
                                poll_errors += 1;
                                tracing::warn!(job_id = %job.id, error = %e, "Result URL not available yet");
                                if poll_errors > self.settings.max_poll_errors {
                                    let message = DispatchError::PollFailures {
                                        count: poll_errors,
                                        last: e,
                                    }
                                    .user_message();
                                    return self.finish(job, Terminal::Failed(message)).await;
                                }
                                continue;
                            }
                        },
                    };
                    return self
                        .complete(job, provider.as_ref(), url, Some(duration_seconds), started)
                        .await;
                }
                Stage::Failed => {
                    self.pipeline.selector.health().record_outcome(provider.name(), false).await;
                    return self.finish(job, Terminal::Failed(failure_message(&progress))).await;
                }
                Stage::Queued | Stage::Processing => {
                    let mut next = job.clone();
                    let advanced = next.advance_progress(progress.percent);
                    if advanced || progress.stage != last_stage {
                        last_stage = progress.stage;
                        match self.save_progress(&next).await? {
                            Some(saved) => {
                                job = saved;
                                self.publish(&JobEvent::from_progress(&job, &progress)).await;
                            }
                            None => return Ok(Outcome::Skipped("finished elsewhere")),
                        }
                    }
                }
            }

            // Checked after progress so a completion observed on this tick
            // wins over a concurrent cancel.
            if self.cancel_requested(job.id).await? {
                tracing::info!(job_id = %job.id, provider = provider.name(), "Cancel requested");
                self.cancel_upstream(provider.as_ref(), &provider_job_id).await;
                return self.finish(job, Terminal::Cancelled).await;
            }
        }
    }

    async fn complete(
        &self,
        job: VideoJob,
        provider: &dyn VideoProvider,
        result_url: String,
        duration_seconds: Option<u32>,
        started: Instant,
    ) -> Result<Outcome, DispatchError> {
        self.pipeline.selector.health().record_outcome(provider.name(), true).await;
        metrics::histogram!("video_generation_seconds", "provider" => provider.name().to_string())
            .record(started.elapsed().as_secs_f64());
        self.finish(
            job,
            Terminal::Completed {
                result_url,
                thumbnail_url: None,
                duration_seconds,
            },
        )
        .await
    }

    async fn finish(&self, job: VideoJob, terminal: Terminal) -> Result<Outcome, DispatchError> {
        let outcome = match &terminal {
            Terminal::Completed { .. } => Outcome::Completed,
            Terminal::Failed(_) => Outcome::Failed,
            Terminal::Cancelled => Outcome::Cancelled,
        };
        match self.pipeline.settle(job, terminal).await? {
            Some(_) => Ok(outcome),
            None => Ok(Outcome::Skipped("finished elsewhere")),
        }
    }

    async fn save(&self, job: &VideoJob) -> Result<VideoJob, DispatchError> {
        Ok(with_retry(&self.settings.retry, "update_job", || self.pipeline.store.update(job)).await?)
    }

    /// Persist a progress change. On a version conflict the fresh record is
    /// adopted; `None` means another writer finished the job.
    async fn save_progress(&self, job: &VideoJob) -> Result<Option<VideoJob>, DispatchError> {
        match self.save(job).await {
            Ok(saved) => Ok(Some(saved)),
            Err(DispatchError::Store(StoreError::Conflict { .. })) => {
                let fresh = with_retry(&self.settings.retry, "reload_job", || {
                    self.pipeline.store.get_by_id(job.id)
                })
                .await?;
                if fresh.is_terminal() {
                    return Ok(None);
                }
                let mut merged = fresh;
                merged.advance_progress(job.progress_percent);
                self.save(&merged).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, event: &JobEvent) {
        self.pipeline.hub.publish(event.job_id, event).await;
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool, DispatchError> {
        Ok(with_retry(&self.settings.retry, "check_cancel", || {
            self.pipeline.queue.is_cancel_requested(job_id)
        })
        .await?)
    }

    async fn renew_lease(&self, delivery: &Delivery) {
        match self.pipeline.queue.extend_lease(delivery).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                job_id = %delivery.job_id,
                "Lease already reclaimed; redelivery will be ignored"
            ),
            Err(e) => tracing::warn!(job_id = %delivery.job_id, error = %e, "Failed to extend lease"),
        }
    }

    /// Upstream cancellation is advisory: failures are logged only.
    async fn cancel_upstream(&self, provider: &dyn VideoProvider, provider_job_id: &str) {
        match with_timeout(self.settings.provider_timeout, provider.cancel(provider_job_id)).await {
            Ok(()) => tracing::info!(provider = provider.name(), provider_job_id, "Upstream task cancelled"),
            Err(ProviderError::NotSupported(_)) => {
                tracing::info!(provider = provider.name(), provider_job_id, "Upstream cancel not supported")
            }
            Err(e) => tracing::warn!(
                provider = provider.name(),
                provider_job_id,
                error = %e,
                "Upstream cancel failed"
            ),
        }
    }
}

fn failure_message(progress: &Progress) -> String {
    match progress.error.as_deref().map(str::trim) {
        Some(cause) if !cause.is_empty() => format!("Video generation failed: {cause}"),
        _ => UNKNOWN_FAILURE_MESSAGE.to_string(),
    }
}

fn lease_chrono(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Names for one pool: `{prefix}-{instance}-{n}`. The instance part is
/// fresh per call, so pools started with the same prefix in different
/// processes never share a claim identity.
pub fn worker_ids(prefix: &str, count: usize) -> Vec<String> {
    let instance = Uuid::new_v4().simple();
    (0..count).map(|n| format!("{prefix}-{instance}-{n}")).collect()
}

/// Spawn `count` workers sharing one pipeline, named by [`worker_ids`].
pub fn spawn_pool(
    pipeline: &Pipeline,
    settings: &WorkerSettings,
    count: usize,
    prefix: &str,
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    worker_ids(prefix, count)
        .into_iter()
        .map(|id| {
            let worker = DispatchWorker::new(id, pipeline.clone(), settings.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
