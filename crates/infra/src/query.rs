//! Read queries over the projections.
//!
//! Strictly read-only: the query service sees the read-model store and the
//! blob adapter (for presigned URLs), never the log or the router. A bill the
//! projection has not caught up with is `NotFound` — callers treat that as
//! "not yet projected or does not exist" and may poll `/consumers`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_billing::BillStatus;
use billflow_core::BillId;

use crate::adapters::BlobStore;
use crate::error::ServiceError;
use crate::read_model::{BillSummaryRow, ReadModelStore};

pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Filters for listing bills. All are conjunctive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillFilter {
    pub status: Option<BillStatus>,
    pub created_by: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub total_min: Option<Decimal>,
    pub total_max: Option<Decimal>,
    /// Case-insensitive substring on the declared title.
    pub title_contains: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Offset pagination over a stable sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub size: u32,
    pub sort: SortField,
    pub order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
            sort: SortField::CreatedAt,
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

/// Listing row: the summary plus derived fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillSummaryView {
    #[serde(flatten)]
    pub row: BillSummaryRow,
    /// OCR-extracted title when present and non-empty, else the declared
    /// title.
    pub effective_title: String,
    /// OCR-extracted total when present, else the declared total.
    pub effective_total: Decimal,
}

impl From<BillSummaryRow> for BillSummaryView {
    fn from(row: BillSummaryRow) -> Self {
        let effective_title = row
            .ocr_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&row.title)
            .to_string();
        let effective_total = row.ocr_total.unwrap_or(row.total);
        Self {
            row,
            effective_title,
            effective_total,
        }
    }
}

/// A file row plus its presigned download URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillFileView {
    #[serde(flatten)]
    pub row: crate::read_model::BillFileRow,
    pub download_url: Option<String>,
}

/// One bill with files, for the detail query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillDetails {
    #[serde(flatten)]
    pub summary: BillSummaryView,
    pub files: Vec<BillFileView>,
}

pub struct QueryService<S, B> {
    store: S,
    blob: B,
    presign_ttl: Duration,
}

impl<S, B> QueryService<S, B>
where
    S: ReadModelStore,
    B: BlobStore,
{
    pub fn new(store: S, blob: B, presign_ttl: Duration) -> Self {
        Self {
            store,
            blob,
            presign_ttl,
        }
    }

    /// Fetch one bill joined with its files and OCR fields.
    pub fn get_bill(&self, bill_id: &BillId) -> Result<BillDetails, ServiceError> {
        let row = self
            .store
            .summary(bill_id)
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))?
            .ok_or(ServiceError::NotFound)?;

        let files = self
            .store
            .files_for(bill_id)
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))?
            .into_iter()
            .map(|file| {
                // URL issuance is best-effort; a blob-store hiccup should not
                // fail the whole read.
                let download_url = self.blob.presign_get(&file.storage_key, self.presign_ttl).ok();
                BillFileView {
                    row: file,
                    download_url,
                }
            })
            .collect();

        Ok(BillDetails {
            summary: row.into(),
            files,
        })
    }

    /// List bills with filters, stable sort, and offset pagination.
    pub fn list_bills(
        &self,
        filter: &BillFilter,
        page: PageRequest,
    ) -> Result<Page<BillSummaryView>, ServiceError> {
        let size = page.size.clamp(1, MAX_PAGE_SIZE);
        let page_number = page.page.max(1);

        let mut rows: Vec<BillSummaryRow> = self
            .store
            .summaries()
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))?
            .into_iter()
            .filter(|row| matches_filter(row, filter))
            .collect();

        // Bill id tiebreak keeps offset pagination stable across requests.
        rows.sort_by(|a, b| {
            let ordering = match page.sort {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::Total => a.total.cmp(&b.total),
            };
            let ordering = match page.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.bill_id.cmp(&b.bill_id))
        });

        let total = rows.len() as u64;
        let offset = (page_number as usize - 1) * size as usize;
        let items = rows
            .into_iter()
            .skip(offset)
            .take(size as usize)
            .map(BillSummaryView::from)
            .collect();

        Ok(Page {
            items,
            page: page_number,
            size,
            total,
        })
    }

    /// Presigned download URL for one attached file.
    pub fn file_download(
        &self,
        bill_id: &BillId,
        file_id: &billflow_core::FileId,
    ) -> Result<String, ServiceError> {
        let file = self
            .store
            .file(bill_id, file_id)
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))?
            .ok_or(ServiceError::NotFound)?;
        self.blob
            .presign_get(&file.storage_key, self.presign_ttl)
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))
    }

    /// Tracking position per consumer — the monotonic value callers poll for
    /// read-your-writes.
    pub fn tracking_positions(&self) -> Result<BTreeMap<String, u64>, ServiceError> {
        self.store
            .tracking_positions()
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))
    }

    pub fn dead_letters(
        &self,
    ) -> Result<Vec<crate::read_model::DeadLetterRow>, ServiceError> {
        self.store
            .dead_letters()
            .map_err(|e| ServiceError::TransientFailure(e.to_string()))
    }
}

fn matches_filter(row: &BillSummaryRow, filter: &BillFilter) -> bool {
    if let Some(status) = filter.status {
        if row.status != status {
            return false;
        }
    }
    if let Some(created_by) = &filter.created_by {
        if &row.created_by != created_by {
            return false;
        }
    }
    if let Some(from) = filter.created_from {
        if row.created_at < from {
            return false;
        }
    }
    if let Some(to) = filter.created_to {
        if row.created_at > to {
            return false;
        }
    }
    if let Some(min) = filter.total_min {
        if row.total < min {
            return false;
        }
    }
    if let Some(max) = filter.total_max {
        if row.total > max {
            return false;
        }
    }
    if let Some(needle) = &filter.title_contains {
        if !row.title.to_lowercase().contains(&needle.to_lowercase()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBlobStore;
    use crate::projections::BILL_SUMMARY;
    use crate::read_model::{InMemoryReadModelStore, RowChange};
    use billflow_core::SystemClock;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn row(bill: &str, total: Decimal, created_by: &str, minute: u32) -> BillSummaryRow {
        BillSummaryRow {
            bill_id: BillId::new(bill).unwrap(),
            title: format!("Bill {bill}"),
            total,
            created_by: created_by.to_string(),
            status: BillStatus::Created,
            created_at: chrono::DateTime::parse_from_rfc3339(&format!(
                "2026-07-01T10:{minute:02}:00Z"
            ))
            .unwrap()
            .with_timezone(&Utc),
            updated_at: Utc::now(),
            file_count: 0,
            ocr_text: None,
            ocr_total: None,
            ocr_title: None,
            ocr_confidence: None,
            approver_id: None,
            decision: None,
            approval_reason: None,
            decided_at: None,
            last_sequence: 0,
        }
    }

    fn service_with(
        rows: Vec<BillSummaryRow>,
    ) -> QueryService<Arc<InMemoryReadModelStore>, Arc<InMemoryBlobStore>> {
        let store = Arc::new(InMemoryReadModelStore::new());
        for (i, r) in rows.into_iter().enumerate() {
            store
                .apply(BILL_SUMMARY, i as u64 + 1, &[RowChange::UpsertSummary(r)])
                .unwrap();
        }
        let blob = Arc::new(InMemoryBlobStore::new(
            "http://localhost/blobs",
            Arc::new(SystemClock),
        ));
        QueryService::new(store, blob, Duration::from_secs(900))
    }

    #[test]
    fn unknown_bill_is_not_found() {
        let service = service_with(vec![]);
        let err = service.get_bill(&BillId::new("nope").unwrap()).unwrap_err();
        assert_eq!(err, ServiceError::NotFound);
    }

    #[test]
    fn effective_fields_prefer_nonempty_ocr_values() {
        let mut with_ocr = row("b1", dec!(10.00), "u1", 0);
        with_ocr.ocr_title = Some("Electric Utility".to_string());
        with_ocr.ocr_total = Some(dec!(150.00));
        let mut with_blank_ocr = row("b2", dec!(20.00), "u1", 1);
        with_blank_ocr.ocr_title = Some("  ".to_string());

        let service = service_with(vec![with_ocr, with_blank_ocr]);

        let page = service.list_bills(&BillFilter::default(), PageRequest {
            sort: SortField::CreatedAt,
            order: SortOrder::Asc,
            ..PageRequest::default()
        }).unwrap();

        assert_eq!(page.items[0].effective_title, "Electric Utility");
        assert_eq!(page.items[0].effective_total, dec!(150.00));
        // Blank OCR title falls back to the declared one.
        assert_eq!(page.items[1].effective_title, "Bill b2");
        assert_eq!(page.items[1].effective_total, dec!(20.00));
    }

    #[test]
    fn filters_compose() {
        let service = service_with(vec![
            row("b1", dec!(10.00), "u1", 0),
            row("b2", dec!(50.00), "u2", 1),
            row("b3", dec!(90.00), "u1", 2),
        ]);

        let filter = BillFilter {
            created_by: Some("u1".to_string()),
            total_min: Some(dec!(20.00)),
            ..BillFilter::default()
        };
        let page = service.list_bills(&filter, PageRequest::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].row.bill_id.as_str(), "b3");

        let filter = BillFilter {
            title_contains: Some("bill B2".to_string()),
            ..BillFilter::default()
        };
        let page = service.list_bills(&filter, PageRequest::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].row.bill_id.as_str(), "b2");
    }

    #[test]
    fn pagination_is_stable_and_size_capped() {
        let rows: Vec<_> = (0..25)
            .map(|i| row(&format!("b{i:02}"), Decimal::from(i), "u1", i as u32))
            .collect();
        let service = service_with(rows);

        let request = PageRequest {
            page: 1,
            size: 1000, // capped to MAX_PAGE_SIZE
            sort: SortField::Total,
            order: SortOrder::Asc,
        };
        let page = service.list_bills(&BillFilter::default(), request).unwrap();
        assert_eq!(page.size, MAX_PAGE_SIZE);
        assert_eq!(page.total, 25);

        let first = service
            .list_bills(&BillFilter::default(), PageRequest {
                page: 1,
                size: 10,
                sort: SortField::Total,
                order: SortOrder::Asc,
            })
            .unwrap();
        let second = service
            .list_bills(&BillFilter::default(), PageRequest {
                page: 2,
                size: 10,
                sort: SortField::Total,
                order: SortOrder::Asc,
            })
            .unwrap();

        assert_eq!(first.items.len(), 10);
        assert_eq!(second.items.len(), 10);
        assert_eq!(first.items[0].row.bill_id.as_str(), "b00");
        assert_eq!(second.items[0].row.bill_id.as_str(), "b10");
    }

    #[test]
    fn sorting_descends_by_total_with_id_tiebreak() {
        let service = service_with(vec![
            row("b2", dec!(50.00), "u1", 0),
            row("b1", dec!(50.00), "u1", 1),
            row("b3", dec!(90.00), "u1", 2),
        ]);

        let page = service
            .list_bills(&BillFilter::default(), PageRequest {
                sort: SortField::Total,
                order: SortOrder::Desc,
                ..PageRequest::default()
            })
            .unwrap();

        let ids: Vec<_> = page.items.iter().map(|i| i.row.bill_id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b1", "b2"]);
    }
}
