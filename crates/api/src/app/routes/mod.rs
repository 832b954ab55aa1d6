pub mod bills;
pub mod system;

use axum::http::HeaderMap;

/// Opaque caller identity, passed through unvalidated.
pub fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-caller-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("anonymous")
        .to_string()
}
