use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};

use billflow_billing::{
    ApprovalDecision, ApproveBill, AttachFile, BillCommand, BillStatus, CreateBill,
};
use billflow_core::{BillId, Clock, FileId};
use billflow_infra::adapters::BlobStore;
use billflow_infra::query::{BillFilter, PageRequest, SortField, SortOrder};

use crate::app::routes::caller_identity;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_bill).get(list_bills))
        .route("/:id", get(get_bill))
        .route("/:id/files", post(attach_file))
        .route("/:id/files/:file_id/download", get(download_file))
        .route("/:id/approval", post(approve_bill))
}

async fn dispatch(
    services: Arc<AppServices>,
    command: BillCommand,
    caller: String,
) -> axum::response::Response {
    let result =
        tokio::task::spawn_blocking(move || services.router.dispatch(command, &caller)).await;
    match result {
        Ok(Ok(receipt)) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": receipt.bill_id.as_str(),
                "next_sequence": receipt.next_sequence,
                "position": receipt.last_position,
            })),
        )
            .into_response(),
        Ok(Err(e)) => errors::service_error_to_response(e),
        Err(e) => {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub async fn create_bill(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::CreateBillRequest>,
) -> axum::response::Response {
    let caller = caller_identity(&headers);

    let bill_id = match body.id {
        None => BillId::generate(),
        Some(raw) => match BillId::new(raw) {
            Ok(id) => id,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
        },
    };

    let command = BillCommand::CreateBill(CreateBill {
        bill_id,
        title: body.title,
        total: body.total,
        metadata: body.metadata,
        created_by: caller.clone(),
        occurred_at: services.clock.now(),
    });

    dispatch(services, command, caller).await
}

pub async fn attach_file(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<dto::AttachFileQuery>,
    body: Bytes,
) -> axum::response::Response {
    let caller = caller_identity(&headers);

    let bill_id = match BillId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };
    if body.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "empty_body", "file body is empty");
    }
    // Refuse before writing the blob; the router enforces the same policy on
    // the command path.
    if body.len() as u64 > services.config.file_policy.max_bytes {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "file_too_large",
            format!("file exceeds {} bytes", services.config.file_policy.max_bytes),
        );
    }

    let content_type = params
        .content_type
        .or_else(|| {
            headers
                .get(axum::http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let file_id = FileId::generate();
    let storage_key = format!("bills/{bill_id}/{file_id}/{}", params.filename);

    let services_for_put = services.clone();
    let key_for_put = storage_key.clone();
    let content_type_for_put = content_type.clone();
    let put_result = tokio::task::spawn_blocking(move || {
        services_for_put
            .blob
            .put(&key_for_put, &body, &content_type_for_put)
            .map(|checksum| (checksum, body.len() as u64))
    })
    .await;

    let (checksum, size_bytes) = match put_result {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => {
            return errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "blob_unavailable", e.to_string());
        }
        Err(e) => {
            return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string());
        }
    };

    let command = BillCommand::AttachFile(AttachFile {
        bill_id,
        file_id,
        filename: params.filename,
        content_type,
        size_bytes,
        storage_key,
        checksum,
        occurred_at: services.clock.now(),
    });

    dispatch(services, command, caller).await
}

pub async fn approve_bill(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<dto::ApprovalRequest>,
) -> axum::response::Response {
    let caller = caller_identity(&headers);

    let bill_id = match BillId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };
    let decision = match body.decision.as_str() {
        "approved" => ApprovalDecision::Approved,
        "rejected" => ApprovalDecision::Rejected,
        _ => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_decision",
                "decision must be \"approved\" or \"rejected\"",
            );
        }
    };

    let command = BillCommand::ApproveBill(ApproveBill {
        bill_id,
        approver_id: caller.clone(),
        decision,
        reason: body.reason,
        occurred_at: services.clock.now(),
    });

    dispatch(services, command, caller).await
}

pub async fn get_bill(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let bill_id = match BillId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    let result = tokio::task::spawn_blocking(move || services.query.get_bill(&bill_id)).await;
    match result {
        Ok(Ok(details)) => Json(details).into_response(),
        Ok(Err(e)) => errors::service_error_to_response(e),
        Err(e) => {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub async fn download_file(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, file_id)): Path<(String, String)>,
) -> axum::response::Response {
    let bill_id = match BillId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };
    let file_id = match FileId::new(file_id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    let result =
        tokio::task::spawn_blocking(move || services.query.file_download(&bill_id, &file_id)).await;
    match result {
        Ok(Ok(url)) => Json(serde_json::json!({ "download_url": url })).into_response(),
        Ok(Err(e)) => errors::service_error_to_response(e),
        Err(e) => {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub async fn list_bills(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::ListBillsQuery>,
) -> axum::response::Response {
    let status = match params.status.as_deref() {
        None => None,
        Some("created") => Some(BillStatus::Created),
        Some("file_attached") => Some(BillStatus::FileAttached),
        Some("processed") => Some(BillStatus::Processed),
        Some("approved") => Some(BillStatus::Approved),
        Some("rejected") => Some(BillStatus::Rejected),
        Some(other) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_status",
                format!("unknown status {other:?}"),
            );
        }
    };

    let created_from = match parse_rfc3339(params.created_from.as_deref()) {
        Ok(v) => v,
        Err(response) => return response,
    };
    let created_to = match parse_rfc3339(params.created_to.as_deref()) {
        Ok(v) => v,
        Err(response) => return response,
    };

    let sort = match params.sort.as_deref() {
        None | Some("created_at") => SortField::CreatedAt,
        Some("total") => SortField::Total,
        Some(other) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_sort",
                format!("unknown sort field {other:?}"),
            );
        }
    };
    let order = match params.order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_order",
                format!("unknown sort order {other:?}"),
            );
        }
    };

    let filter = BillFilter {
        status,
        created_by: params.created_by,
        created_from,
        created_to,
        total_min: params.total_min,
        total_max: params.total_max,
        title_contains: params.title_contains,
    };
    let page = PageRequest {
        page: params.page.unwrap_or(1),
        size: params.size.unwrap_or(billflow_infra::query::DEFAULT_PAGE_SIZE),
        sort,
        order,
    };

    let result = tokio::task::spawn_blocking(move || services.query.list_bills(&filter, page)).await;
    match result {
        Ok(Ok(listing)) => Json(listing).into_response(),
        Ok(Err(e)) => errors::service_error_to_response(e),
        Err(e) => {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

fn parse_rfc3339(
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, axum::response::Response> {
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_timestamp",
                    "timestamps must be RFC3339",
                )
            }),
    }
}
