//! API module for all HTTP handlers

pub mod health;
pub mod submit;

use axum::{
    Router,
    routing::{any, get},
};
use tower_http::trace::TraceLayer;

use crate::SharedState;

pub use health::health;
pub use submit::handle_submission;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // any method, so the handler can answer 405 in the same JSON shape
        .route("/", any(handle_submission))
        .route("/api/send-location", any(handle_submission))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
