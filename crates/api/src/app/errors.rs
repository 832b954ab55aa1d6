use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use billflow_infra::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::BusinessRuleViolation { code, message } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "business_rule_violation",
                "reason": code.as_str(),
                "message": message,
            })),
        )
            .into_response(),
        ServiceError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        ServiceError::ConcurrencyConflict(message) => {
            json_error(StatusCode::CONFLICT, "concurrency_conflict", message)
        }
        ServiceError::Cancelled => json_error(
            // Non-standard "client closed request"; the closest fit for a
            // cancellation observed before any effect.
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "cancelled",
            "request cancelled before append",
        ),
        ServiceError::TransientFailure(message) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "transient_failure", message)
        }
        ServiceError::InternalError(message) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
