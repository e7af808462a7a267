use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Error type for geo_relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("Origin not allowed")]
    Origin,

    #[error("Method not allowed")]
    Method,

    #[error("Too many requests. Please try again later.")]
    QuotaExceeded,

    #[error("Rate limit backend unavailable: {0}")]
    Backend(String),

    #[error("{0}")]
    Relay(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Origin => StatusCode::FORBIDDEN,
            RelayError::Method => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Replaces caller-facing detail with a generic message. Used when the
    /// deployment does not want validation or relay internals disclosed.
    pub fn genericized(self) -> Self {
        match self {
            RelayError::Validation(_) => RelayError::Validation("Invalid request.".to_string()),
            RelayError::Relay(_) => RelayError::Relay("Failed to send data.".to_string()),
            other => other,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // startup errors should never reach a client, but don't leak paths if they do
            RelayError::ConfigError(_) | RelayError::TomlParseError(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

/// Helper type for Results that use RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
