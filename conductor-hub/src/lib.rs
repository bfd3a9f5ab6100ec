//! Coordination hub: executor callbacks, spawning, event fan-out, and the
//! HTTP surface that exposes them.

pub mod hub;
pub mod routes;
pub mod spawner;
pub mod sse;
pub mod state;
pub mod watcher;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Full application router: `/api/*` plus the `/events` stream.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state)
}
