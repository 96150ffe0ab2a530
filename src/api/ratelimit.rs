//! Rate limit rule management and violation introspection.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ratelimit::{RateLimitRule, RateLimitViolation, RuleView};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct RuleListResponse {
    pub rules: Vec<RuleView>,
}

/// GET /api/v1/admin/ratelimit/rules
pub async fn list_rules(State(state): State<AppState>) -> Json<RuleListResponse> {
    Json(RuleListResponse {
        rules: state.limiter.rules(),
    })
}

/// POST /api/v1/admin/ratelimit/rules
pub async fn add_rule(
    State(state): State<AppState>,
    Json(rule): Json<RateLimitRule>,
) -> Result<Json<RateLimitRule>, AppError> {
    state.limiter.add_rule(rule.clone())?;
    tracing::info!(rule_id = %rule.id, "Rate limit rule added");
    Ok(Json(rule))
}

/// PUT /api/v1/admin/ratelimit/rules/{id}
pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(rule): Json<RateLimitRule>,
) -> Result<Json<RateLimitRule>, AppError> {
    state.limiter.update_rule(&id, rule.clone())?;
    tracing::info!(rule_id = %id, "Rate limit rule updated");
    Ok(Json(rule))
}

/// DELETE /api/v1/admin/ratelimit/rules/{id}
pub async fn remove_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.limiter.remove_rule(&id) {
        return Err(AppError::NotFound(format!("rule {}", id)));
    }
    tracing::info!(rule_id = %id, "Rate limit rule removed");
    Ok(Json(serde_json::json!({ "removed": id })))
}

fn default_violation_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct ViolationsQuery {
    #[serde(default = "default_violation_limit")]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct ViolationsResponse {
    pub violations: Vec<RateLimitViolation>,
    pub last_hour: usize,
    pub total: u64,
}

/// GET /api/v1/admin/ratelimit/violations
pub async fn list_violations(
    State(state): State<AppState>,
    Query(query): Query<ViolationsQuery>,
) -> Json<ViolationsResponse> {
    Json(ViolationsResponse {
        violations: state.limiter.recent_violations(query.limit),
        last_hour: state.limiter.violations_last_hour(),
        total: state.limiter.total_violations(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub identity: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub cleared: usize,
}

/// POST /api/v1/admin/ratelimit/reset
pub async fn reset_limits(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, AppError> {
    if request.identity.is_none() && request.ip.is_none() {
        return Err(AppError::Validation(
            "provide an identity or an ip to reset".to_string(),
        ));
    }

    let cleared = state
        .limiter
        .reset_connection_limits(request.identity.as_deref(), request.ip.as_deref());
    Ok(Json(ResetResponse { cleared }))
}
