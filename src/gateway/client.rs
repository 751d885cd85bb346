//! Client identity resolution for rate limiting

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Identifier used when no source of client identity is available
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Resolve the identifier a request is rate limited under
///
/// Order: first `X-Forwarded-For` entry, `X-Real-IP`, socket peer address,
/// then [`UNKNOWN_CLIENT`].
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    header_value(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            header_value(headers, "x-real-ip")
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
