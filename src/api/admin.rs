//! Admin endpoints: connection introspection and mutations.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admin::{BroadcastTarget, StatsSnapshot};
use crate::channels::PublishOutcome;
use crate::error::AppError;
use crate::registry::{ChannelInfo, ConnectionInfo, RoomInfo};
use crate::server::AppState;

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct ListConnectionsQuery {
    pub identity: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionInfo>,
    /// Count matching the filter, not the page size.
    pub total: usize,
}

/// GET /api/v1/admin/connections
pub async fn list_connections(
    State(state): State<AppState>,
    Query(query): Query<ListConnectionsQuery>,
) -> Json<ConnectionListResponse> {
    let (connections, total) = state
        .admin
        .list_connections(query.identity.as_deref(), query.offset, query.limit)
        .await;

    Json(ConnectionListResponse { connections, total })
}

/// GET /api/v1/admin/connections/{id}
pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConnectionInfo>, AppError> {
    state
        .admin
        .get_connection(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("connection {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "disconnected by administrator".to_string()
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub disconnected: usize,
}

/// DELETE /api/v1/admin/connections/{id}
pub async fn disconnect_connection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<DisconnectRequest>,
) -> Result<Json<DisconnectResponse>, AppError> {
    state.admin.disconnect_connection(id, &request.reason).await?;
    Ok(Json(DisconnectResponse { disconnected: 1 }))
}

/// DELETE /api/v1/admin/identities/{identity}
pub async fn disconnect_identity(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(request): Json<DisconnectRequest>,
) -> Json<DisconnectResponse> {
    let disconnected = state
        .admin
        .disconnect_identity(&identity, &request.reason)
        .await;
    Json(DisconnectResponse { disconnected })
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
    #[serde(flatten)]
    pub target: BroadcastTarget,
}

/// POST /api/v1/admin/broadcast
pub async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<PublishOutcome>, AppError> {
    let outcome = state
        .admin
        .broadcast_admin_message(&request.message, request.target)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

/// POST /api/v1/admin/cleanup
pub async fn cleanup_stale(State(state): State<AppState>) -> Json<CleanupResponse> {
    let removed = state.admin.cleanup_stale_connections();
    Json(CleanupResponse { removed })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_hours")]
    pub hours: u64,
}

fn default_history_hours() -> u64 {
    24
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub snapshots: Vec<StatsSnapshot>,
}

/// GET /api/v1/admin/stats/history
pub async fn stats_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        snapshots: state.admin.get_stats_history(query.hours),
    })
}

#[derive(Debug, Serialize)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelInfo>,
    pub total_channels: usize,
}

/// GET /api/v1/channels
pub async fn list_channels(State(state): State<AppState>) -> Json<ChannelListResponse> {
    let channels = state.admin.list_channels();
    let total = channels.len();

    Json(ChannelListResponse {
        channels,
        total_channels: total,
    })
}

/// GET /api/v1/rooms/{name}
pub async fn get_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomInfo>, AppError> {
    Ok(Json(state.admin.get_room(&name).await?))
}
