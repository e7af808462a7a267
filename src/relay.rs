//! Outbound delivery to the Telegram Bot API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{RelayError, Result};
use crate::intake::LocationReport;
use crate::message::{MessageTemplate, PARSE_MODE};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub api_base: String,
    /// Overridden by the `BOT_TOKEN` environment variable.
    pub bot_token: Option<String>,
    pub template: MessageTemplate,
    pub timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: None,
            template: MessageTemplate::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// The two calls a submission is relayed with.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn send_location(&self, chat_id: &str, latitude: &str, longitude: &str) -> Result<()>;

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Sends the location, then the text. The text is skipped if the location fails.
pub async fn deliver(relay: &dyn Relay, report: &LocationReport, text: &str) -> Result<()> {
    relay
        .send_location(&report.chat_id, &report.latitude, &report.longitude)
        .await?;
    relay.send_message(&report.chat_id, text).await
}

/// Bot API reply envelope. Only the status matters here.
#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramRelay {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramRelay {
    pub fn new(settings: &RelaySettings, bot_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<()> {
        let url = format!("{}/bot{}/{}", self.api_base, self.bot_token, method);
        debug!("Calling Bot API method {}", method);

        // the URL carries the bot token, keep it out of error text
        let response = self
            .client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                error!("{} request failed: {}", method, e);
                RelayError::Relay(format!("Failed to send data: {}", e))
            })?;

        let reply: ApiReply = response.json().await.map_err(|e| {
            let e = e.without_url();
            error!("{} returned an unreadable reply: {}", method, e);
            RelayError::Relay(format!("Failed to send data: {}", e))
        })?;

        if reply.ok {
            Ok(())
        } else {
            let description = reply
                .description
                .unwrap_or_else(|| format!("{} failed", method));
            error!("{} rejected: {}", method, description);
            Err(RelayError::Relay(description))
        }
    }
}

#[async_trait]
impl Relay for TelegramRelay {
    async fn send_location(&self, chat_id: &str, latitude: &str, longitude: &str) -> Result<()> {
        self.call(
            "sendLocation",
            &[
                ("chat_id", chat_id),
                ("latitude", latitude),
                ("longitude", longitude),
            ],
        )
        .await
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        self.call(
            "sendMessage",
            &[("chat_id", chat_id), ("text", text), ("parse_mode", PARSE_MODE)],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::DeviceInfo;
    use axum::{Form, Json, Router, extract::State, routing::post};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(String, HashMap<String, String>)>>>;

    #[derive(Clone)]
    struct FakeBotApi {
        calls: Calls,
        fail_location: bool,
    }

    async fn send_location(
        State(api): State<FakeBotApi>,
        Form(params): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        api.calls
            .lock()
            .unwrap()
            .push(("sendLocation".to_string(), params));
        if api.fail_location {
            Json(json!({ "ok": false, "error_code": 400, "description": "Bad Request: chat not found" }))
        } else {
            Json(json!({ "ok": true, "result": {} }))
        }
    }

    async fn send_message(
        State(api): State<FakeBotApi>,
        Form(params): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        api.calls
            .lock()
            .unwrap()
            .push(("sendMessage".to_string(), params));
        Json(json!({ "ok": true, "result": {} }))
    }

    async fn serve_fake(fail_location: bool) -> (String, Calls) {
        let calls: Calls = Arc::default();
        let api = FakeBotApi {
            calls: calls.clone(),
            fail_location,
        };
        let app = Router::new()
            .route("/bottest-token/sendLocation", post(send_location))
            .route("/bottest-token/sendMessage", post(send_message))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), calls)
    }

    fn report() -> LocationReport {
        LocationReport {
            chat_id: "123".into(),
            latitude: "40.0".into(),
            longitude: "-74.0".into(),
            device: DeviceInfo::default(),
        }
    }

    fn relay(api_base: String) -> TelegramRelay {
        let settings = RelaySettings {
            api_base,
            ..RelaySettings::default()
        };
        TelegramRelay::new(&settings, "test-token").unwrap()
    }

    #[tokio::test]
    async fn sends_location_then_message() {
        let (base, calls) = serve_fake(false).await;

        deliver(&relay(base), &report(), "hello").await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "sendLocation");
        assert_eq!(calls[0].1["chat_id"], "123");
        assert_eq!(calls[0].1["latitude"], "40.0");
        assert_eq!(calls[0].1["longitude"], "-74.0");
        assert_eq!(calls[1].0, "sendMessage");
        assert_eq!(calls[1].1["text"], "hello");
        assert_eq!(calls[1].1["parse_mode"], "Markdown");
    }

    #[tokio::test]
    async fn failed_location_skips_message() {
        let (base, calls) = serve_fake(true).await;

        let err = deliver(&relay(base), &report(), "hello").await.unwrap_err();

        assert_eq!(err.to_string(), "Bad Request: chat not found");
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_token() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = deliver(&relay(base), &report(), "hello").await.unwrap_err();

        assert!(matches!(err, RelayError::Relay(_)));
        assert!(!err.to_string().contains("test-token"));
    }
}
