use axum::http::{HeaderMap, header};
use std::net::SocketAddr;

const UNKNOWN_CLIENT: &str = "unknown";

/// Derives the rate-limit key for a request.
///
/// First entry of `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
/// The value is not checked to be an address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    match forwarded.or_else(real_ip) {
        Some(key) => key.to_string(),
        None => peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string()),
    }
}

/// An empty allow-list disables the check. Otherwise the `Origin` header
/// must be present and match an entry exactly (trailing slashes ignored).
pub fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let origin = origin.trim_end_matches('/');

    allowed
        .iter()
        .any(|entry| entry == "*" || entry.trim_end_matches('/') == origin)
}
