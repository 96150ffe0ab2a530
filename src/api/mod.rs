//! Admin and observability HTTP surface. Every handler delegates to the
//! admin service or the rate limiter; no business logic lives here.

mod admin;
mod health;
mod ratelimit;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::server::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & observability
        .route("/health", get(health::health))
        .route("/stats", get(health::stats))
        .route("/metrics", get(health::metrics))
        .nest(
            "/api/v1",
            Router::new()
                .route("/channels", get(admin::list_channels))
                .route("/rooms/{name}", get(admin::get_room))
                .nest(
                    "/admin",
                    Router::new()
                        .route("/connections", get(admin::list_connections))
                        .route(
                            "/connections/{id}",
                            get(admin::get_connection).delete(admin::disconnect_connection),
                        )
                        .route("/identities/{identity}", delete(admin::disconnect_identity))
                        .route("/broadcast", post(admin::broadcast))
                        .route("/cleanup", post(admin::cleanup_stale))
                        .route("/stats/history", get(admin::stats_history))
                        .route(
                            "/ratelimit/rules",
                            get(ratelimit::list_rules).post(ratelimit::add_rule),
                        )
                        .route(
                            "/ratelimit/rules/{id}",
                            put(ratelimit::update_rule).delete(ratelimit::remove_rule),
                        )
                        .route("/ratelimit/violations", get(ratelimit::list_violations))
                        .route("/ratelimit/reset", post(ratelimit::reset_limits)),
                ),
        )
}
