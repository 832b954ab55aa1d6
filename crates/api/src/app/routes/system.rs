use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> axum::response::Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

/// Tracking position per consumer: the monotonic values callers poll for
/// read-your-writes.
pub async fn consumers(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let result = tokio::task::spawn_blocking(move || services.query.tracking_positions()).await;
    match result {
        Ok(Ok(positions)) => Json(positions).into_response(),
        Ok(Err(e)) => errors::service_error_to_response(e),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

pub async fn dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let result = tokio::task::spawn_blocking(move || services.query.dead_letters()).await;
    match result {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => errors::service_error_to_response(e),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}
