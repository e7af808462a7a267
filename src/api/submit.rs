//! Location submission handler

use axum::{
    Form, Json,
    extract::{ConnectInfo, State as AxumState, rejection::FormRejection},
    http::{Extensions, HeaderMap, Method},
    response::{IntoResponse, Response},
};
use chrono::Local;
use serde_json::json;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use crate::SharedState;
use crate::error::{RelayError, Result};
use crate::intake::parse_submission;
use crate::rate_limit::{BackendFailurePolicy, Decision, RejectionStyle};
use crate::relay::deliver;
use crate::utils::{client_key, origin_allowed};

/// Handles a form-encoded location submission.
///
/// Order: method, origin, form validation, rate limit, relay. Anything
/// rejected before the rate limit never touches the client's quota.
pub async fn handle_submission(
    AxumState(state): AxumState<SharedState>,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
    form: std::result::Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Response {
    match submit(&state, method, &headers, &extensions, form).await {
        Ok(response) => response,
        Err(e) if state.config.errors.expose_details => e.into_response(),
        Err(e) => e.genericized().into_response(),
    }
}

async fn submit(
    state: &SharedState,
    method: Method,
    headers: &HeaderMap,
    extensions: &Extensions,
    form: std::result::Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Result<Response> {
    if method != Method::POST {
        return Err(RelayError::Method);
    }

    if !origin_allowed(headers, &state.config.server.allowed_origins) {
        warn!(
            "Rejected submission from origin {:?}",
            headers.get("origin")
        );
        return Err(RelayError::Origin);
    }

    let Form(fields) =
        form.map_err(|e| RelayError::Validation(format!("Malformed form body: {}", e.body_text())))?;
    let report = parse_submission(fields, &state.config.intake)?;

    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(headers, peer);

    if let Some(limiter) = &state.limiter {
        match limiter.admit(&key).await {
            Decision::Admitted => {}
            Decision::Rejected => {
                let limits = &state.config.rate_limit;
                warn!(
                    "Too many requests from {} - {} requests per {} seconds",
                    key, limits.max_requests, limits.window_secs
                );
                return match limits.rejection {
                    RejectionStyle::Hard => Err(RelayError::QuotaExceeded),
                    RejectionStyle::Soft => Ok(Json(json!({
                        "ok": false,
                        "limited": true,
                        "error": RelayError::QuotaExceeded.to_string(),
                    }))
                    .into_response()),
                };
            }
            Decision::Unknown => match state.config.rate_limit.on_backend_error {
                BackendFailurePolicy::FailOpen => {
                    warn!("Rate limit backend unavailable, admitting {} (fail-open)", key);
                }
                BackendFailurePolicy::FailClosed => {
                    error!("Rate limit backend unavailable, refusing {}", key);
                    return Err(RelayError::Backend(format!(
                        "{} backend did not answer",
                        limiter.backend_name()
                    )));
                }
            },
        }
    }

    let text = state
        .config
        .relay
        .template
        .render(&report, Local::now().fixed_offset());
    deliver(state.relay.as_ref(), &report, &text).await?;

    info!("Relayed location from {} to chat {}", key, report.chat_id);
    Ok(Json(json!({ "ok": true })).into_response())
}
