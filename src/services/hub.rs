use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::event::JobEvent;

/// Identifies one subscribed client connection.
pub type ConnectionId = Uuid;

/// Receiving end handed to a connection handler.
///
/// The stream ends after the job's terminal event or when the hub drops the
/// connection for falling behind.
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub events: mpsc::Receiver<JobEvent>,
}

#[derive(Default)]
struct Registry {
    by_job: HashMap<Uuid, HashMap<ConnectionId, mpsc::Sender<JobEvent>>>,
    by_connection: HashMap<ConnectionId, Uuid>,
}

impl Registry {
    fn remove(&mut self, connection_id: ConnectionId) -> bool {
        let Some(job_id) = self.by_connection.remove(&connection_id) else {
            return false;
        };
        if let Some(connections) = self.by_job.get_mut(&job_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                self.by_job.remove(&job_id);
            }
        }
        true
    }
}

/// In-process fan-out of job progress events to live client connections.
///
/// Delivery is best-effort. Each connection has a bounded buffer; a
/// connection whose buffer is full or whose receiver is gone is dropped and
/// the event discarded. The job record stays authoritative, so a client that
/// misses an event re-reads the job.
pub struct NotificationHub {
    registry: RwLock<Registry>,
    buffer: usize,
}

impl NotificationHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            buffer: buffer.max(1),
        }
    }

    pub async fn subscribe(&self, job_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let connection_id = Uuid::new_v4();

        let mut registry = self.registry.write().await;
        registry
            .by_job
            .entry(job_id)
            .or_default()
            .insert(connection_id, tx);
        registry.by_connection.insert(connection_id, job_id);

        tracing::debug!(job_id = %job_id, connection_id = %connection_id, "Subscriber registered");
        Subscription {
            connection_id,
            events: rx,
        }
    }

    /// Safe to call for connections that were already removed.
    pub async fn unsubscribe(&self, connection_id: ConnectionId) {
        if self.registry.write().await.remove(connection_id) {
            tracing::debug!(connection_id = %connection_id, "Subscriber removed");
        }
    }

    /// Fan `event` out to every subscriber of `job_id`. Returns how many
    /// connections accepted it.
    ///
    /// After a terminal event the job's subscribers are released, which ends
    /// their streams.
    pub async fn publish(&self, job_id: Uuid, event: &JobEvent) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let registry = self.registry.read().await;
            let Some(connections) = registry.by_job.get(&job_id) else {
                return 0;
            };
            for (connection_id, tx) in connections {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dropped.push(*connection_id),
                }
            }
        }

        if !dropped.is_empty() {
            metrics::counter!("video_hub_dropped_events_total").increment(dropped.len() as u64);
            tracing::warn!(
                job_id = %job_id,
                dropped = dropped.len(),
                "Dropping slow or disconnected subscribers"
            );
        }

        if event.is_terminal() || !dropped.is_empty() {
            let mut registry = self.registry.write().await;
            if event.is_terminal() {
                let finished: Vec<ConnectionId> = registry
                    .by_job
                    .get(&job_id)
                    .map(|connections| connections.keys().copied().collect())
                    .unwrap_or_default();
                for connection_id in finished {
                    registry.remove(connection_id);
                }
            } else {
                for connection_id in dropped {
                    registry.remove(connection_id);
                }
            }
        }

        delivered
    }

    pub async fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.registry
            .read()
            .await
            .by_job
            .get(&job_id)
            .map_or(0, HashMap::len)
    }
}
