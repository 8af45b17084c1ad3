use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::event::JobEvent;
use crate::routes::error::ApiResult;
use crate::routes::owner::Owner;

/// GET /api/v1/ws/videos/{id} — live progress for one job.
///
/// The owner check happens before the upgrade so a foreign or unknown job
/// answers 404 instead of an empty stream.
pub async fn job_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.jobs.get(owner, job_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, owner, job_id)))
}

/// Per-connection filter: progress never goes backwards on one stream.
#[derive(Default)]
struct ProgressFilter {
    last_percent: u8,
}

impl ProgressFilter {
    fn admit(&mut self, event: &JobEvent) -> bool {
        if !event.is_terminal() && event.progress_percent < self.last_percent {
            return false;
        }
        self.last_percent = self.last_percent.max(event.progress_percent);
        true
    }
}

async fn send_event(sink: &mut futures::stream::SplitSink<WebSocket, Message>, event: &JobEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(job_id = %event.job_id, error = %e, "Failed to encode job event");
            false
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, owner: Uuid, job_id: Uuid) {
    // Subscribe before reading the snapshot so no transition falls between.
    let mut subscription = state.pipeline.hub.subscribe(job_id).await;
    let connection_id = subscription.connection_id;
    tracing::info!(job_id = %job_id, connection_id = %connection_id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let mut filter = ProgressFilter::default();

    let snapshot = match state.jobs.get(owner, job_id).await {
        Ok(job) => JobEvent::from_job(&job),
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Job vanished before snapshot");
            state.pipeline.hub.unsubscribe(connection_id).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    filter.admit(&snapshot);
    let mut open = send_event(&mut sink, &snapshot).await && !snapshot.is_terminal();

    while open {
        tokio::select! {
            event = subscription.events.recv() => match event {
                Some(event) => {
                    if !filter.admit(&event) {
                        continue;
                    }
                    open = send_event(&mut sink, &event).await && !event.is_terminal();
                }
                // Released by the hub: terminal event delivered or buffer overrun.
                None => open = false,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                    open = false;
                }
            },
        }
    }

    state.pipeline.hub.unsubscribe(connection_id).await;
    let _ = sink.send(Message::Close(None)).await;
    tracing::info!(job_id = %job_id, connection_id = %connection_id, "WebSocket disconnected");
}
