//! Read-model store: disposable tables derived from the event log.
//!
//! The store's contract is the atomicity invariant: row changes for a
//! consumer and that consumer's tracking-token advance commit together, so a
//! crash and restart resumes with no gap and no duplicated write. Everything
//! here can be rebuilt from the log.

pub mod in_memory;
pub mod postgres;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use billflow_billing::{ApprovalDecision, BillStatus};
use billflow_core::{BillId, FileId};

pub use in_memory::InMemoryReadModelStore;
pub use postgres::PostgresReadModelStore;

/// One row per bill in the `bill_summary` projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillSummaryRow {
    pub bill_id: BillId,
    pub title: String,
    pub total: Decimal,
    pub created_by: String,
    pub status: BillStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub file_count: u32,
    pub ocr_text: Option<String>,
    pub ocr_total: Option<Decimal>,
    pub ocr_title: Option<String>,
    pub ocr_confidence: Option<String>,
    pub approver_id: Option<String>,
    pub decision: Option<ApprovalDecision>,
    pub approval_reason: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Last entity sequence folded into this row.
    pub last_sequence: u64,
}

/// One row per attached file in the `bill_files` projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillFileRow {
    pub bill_id: BillId,
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub checksum: String,
    pub attached_at: DateTime<Utc>,
}

/// An event a consumer gave up on within its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub consumer: String,
    pub position: u64,
    pub kind: String,
    pub bill_id: BillId,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// A single write a projection handler decided for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    UpsertSummary(BillSummaryRow),
    UpsertFile(BillFileRow),
    DeadLetter(DeadLetterRow),
}

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt read model row: {0}")]
    Corrupt(String),
}

/// Storage for the projections and their tracking tokens.
pub trait ReadModelStore: Send + Sync {
    /// Last position successfully processed by `consumer` (0 = nothing yet).
    fn tracking_position(&self, consumer: &str) -> Result<u64, ReadModelError>;

    /// Commit `changes` and advance `consumer`'s token to `position`
    /// atomically. Applying at a position at or below the current token is
    /// a no-op (idempotent replays).
    fn apply(
        &self,
        consumer: &str,
        position: u64,
        changes: &[RowChange],
    ) -> Result<(), ReadModelError>;

    /// Zero the consumer's token and truncate the rows it owns, for replay
    /// from scratch.
    fn reset(&self, consumer: &str) -> Result<(), ReadModelError>;

    fn summary(&self, bill_id: &BillId) -> Result<Option<BillSummaryRow>, ReadModelError>;

    /// All summary rows. Filtering, sorting and pagination happen in the
    /// query service.
    fn summaries(&self) -> Result<Vec<BillSummaryRow>, ReadModelError>;

    /// Files for one bill in attach order.
    fn files_for(&self, bill_id: &BillId) -> Result<Vec<BillFileRow>, ReadModelError>;

    fn file(
        &self,
        bill_id: &BillId,
        file_id: &FileId,
    ) -> Result<Option<BillFileRow>, ReadModelError>;

    fn dead_letters(&self) -> Result<Vec<DeadLetterRow>, ReadModelError>;

    /// Token per consumer, for the read-your-writes poll surface.
    fn tracking_positions(&self) -> Result<BTreeMap<String, u64>, ReadModelError>;
}

impl<S> ReadModelStore for std::sync::Arc<S>
where
    S: ReadModelStore + ?Sized,
{
    fn tracking_position(&self, consumer: &str) -> Result<u64, ReadModelError> {
        (**self).tracking_position(consumer)
    }

    fn apply(
        &self,
        consumer: &str,
        position: u64,
        changes: &[RowChange],
    ) -> Result<(), ReadModelError> {
        (**self).apply(consumer, position, changes)
    }

    fn reset(&self, consumer: &str) -> Result<(), ReadModelError> {
        (**self).reset(consumer)
    }

    fn summary(&self, bill_id: &BillId) -> Result<Option<BillSummaryRow>, ReadModelError> {
        (**self).summary(bill_id)
    }

    fn summaries(&self) -> Result<Vec<BillSummaryRow>, ReadModelError> {
        (**self).summaries()
    }

    fn files_for(&self, bill_id: &BillId) -> Result<Vec<BillFileRow>, ReadModelError> {
        (**self).files_for(bill_id)
    }

    fn file(
        &self,
        bill_id: &BillId,
        file_id: &FileId,
    ) -> Result<Option<BillFileRow>, ReadModelError> {
        (**self).file(bill_id, file_id)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterRow>, ReadModelError> {
        (**self).dead_letters()
    }

    fn tracking_positions(&self) -> Result<BTreeMap<String, u64>, ReadModelError> {
        (**self).tracking_positions()
    }
}
