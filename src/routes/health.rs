use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::provider_health::ProviderStatus;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    pub providers: Vec<ProviderHealthEntry>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct ProviderHealthEntry {
    pub name: String,
    #[serde(flatten)]
    pub status: ProviderStatus,
}

fn component<E>(result: Result<(), E>, start: std::time::Instant) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    }
}

/// GET /health — store, queue and provider status.
///
/// Provider health is advisory: an unhealthy provider degrades the report
/// but only a missing store or queue makes the service unavailable.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let db_check = component(state.pipeline.store.ping().await, start);

    let redis_start = std::time::Instant::now();
    let redis_check = component(state.pipeline.queue.health_check().await, redis_start);

    let selector = &state.pipeline.selector;
    selector.health().refresh(selector.registry()).await;
    let providers: Vec<ProviderHealthEntry> = selector
        .health()
        .statuses(selector.registry())
        .await
        .into_iter()
        .map(|(name, status)| ProviderHealthEntry { name, status })
        .collect();

    let infrastructure_ok = db_check.status == "ok" && redis_check.status == "ok";
    let any_provider = providers.iter().any(|p| p.status.healthy);
    let status_code = if infrastructure_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if infrastructure_ok && any_provider {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
            providers,
        },
    };

    (status_code, Json(response))
}
