use axum::{http::HeaderValue, routing::get, Router};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api::api_routes;
use crate::websocket::ws_handler;

use super::AppState;

pub fn create_app(state: AppState) -> Router {
    // An empty origin list means any origin is accepted.
    let allow_origin = if state.settings.server.cors_origins.is_empty() {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = state
            .settings
            .server
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        // Admin and observability routes
        .merge(api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
