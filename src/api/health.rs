use axum::{Json, extract::State as AxumState, response::IntoResponse};
use chrono::Utc;
use serde_json::json;

use crate::SharedState;

/// GET /health
pub async fn health(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "started_at": state.started_at.to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "rate_limit": state.limiter.as_ref().map(|l| l.backend_name()),
    }))
}
