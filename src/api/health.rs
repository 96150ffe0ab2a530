//! Health, stats and metrics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::admin::StatsSnapshot;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub bus: BusHealth,
    pub connections: usize,
}

#[derive(Debug, Serialize)]
pub struct BusHealth {
    pub distributed: bool,
    pub healthy: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let bus = state.channels.bus();

    Json(HealthResponse {
        status: "ok",
        bus: BusHealth {
            distributed: bus.is_distributed(),
            healthy: bus.is_healthy(),
        },
        connections: state.registry.connection_count(),
    })
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.admin.get_stats())
}

/// GET /metrics
pub async fn metrics() -> Result<String, (StatusCode, String)> {
    crate::metrics::encode_metrics()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
