//! Route modules for the tus server

pub mod health;
pub mod tus;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn router(state: AppState) -> Router {
    // Chunks may be as large as the whole upload
    let body_limit = match state.config().upload.max_size {
        0 => DefaultBodyLimit::disable(),
        max => DefaultBodyLimit::max(usize::try_from(max).unwrap_or(usize::MAX)),
    };

    // Browser clients must be able to read the protocol headers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/files", tus::router())
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
