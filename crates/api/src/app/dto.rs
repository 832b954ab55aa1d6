use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Deserialize;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBillRequest {
    /// Caller-supplied bill id; generated when absent.
    pub id: Option<String>,
    pub title: String,
    pub total: Decimal,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachFileQuery {
    pub filename: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    /// "approved" or "rejected".
    pub decision: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListBillsQuery {
    pub status: Option<String>,
    pub created_by: Option<String>,
    /// RFC3339.
    pub created_from: Option<String>,
    /// RFC3339.
    pub created_to: Option<String>,
    pub total_min: Option<Decimal>,
    pub total_max: Option<Decimal>,
    pub title_contains: Option<String>,
    pub page: Option<u32>,
    pub size: Option<u32>,
    /// "created_at" (default) or "total".
    pub sort: Option<String>,
    /// "asc" or "desc" (default).
    pub order: Option<String>,
}
