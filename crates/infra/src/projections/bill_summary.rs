//! `bill-summary` projection: one row per bill, folded from its events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use billflow_billing::{ApprovalDecision, BillEvent, BillStatus, codec};
use billflow_core::BillId;
use billflow_events::EventRecord;

use crate::consumer::{HandlerError, LogHandler};
use crate::read_model::{BillSummaryRow, ReadModelStore, RowChange};

use super::BILL_SUMMARY;

/// Projection handler for the bill summary table.
///
/// The row cache is sound because each consumer is its own table's single
/// writer: reads go through the cache first, so a batch larger than one sees
/// its own staged rows.
pub struct BillSummaryProjection<S> {
    store: S,
    rows: HashMap<BillId, BillSummaryRow>,
    dropped: Arc<AtomicU64>,
}

impl<S> BillSummaryProjection<S>
where
    S: ReadModelStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            rows: HashMap::new(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of events dropped because their row did not exist (replay in
    /// progress or a reset downstream). Clone before spawning the consumer.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    fn current(&mut self, bill_id: &BillId) -> Result<Option<BillSummaryRow>, HandlerError> {
        if let Some(row) = self.rows.get(bill_id) {
            return Ok(Some(row.clone()));
        }
        self.store
            .summary(bill_id)
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }

    /// Row-expected events drop with a warning when the row is missing; that
    /// is a replay-in-progress signal, not a failure.
    fn missing_row(&mut self, record: &EventRecord) -> Vec<RowChange> {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            consumer = BILL_SUMMARY,
            bill_id = %record.entity_id,
            kind = %record.kind,
            position = record.position,
            "dropping event for unknown bill"
        );
        vec![]
    }

    fn stage(&mut self, row: BillSummaryRow) -> Vec<RowChange> {
        self.rows.insert(row.bill_id.clone(), row.clone());
        vec![RowChange::UpsertSummary(row)]
    }
}

impl<S> LogHandler for BillSummaryProjection<S>
where
    S: ReadModelStore,
{
    fn consumer_name(&self) -> &'static str {
        BILL_SUMMARY
    }

    fn handle(&mut self, record: &EventRecord) -> Result<Vec<RowChange>, HandlerError> {
        let event =
            codec::decode_record(record).map_err(|e| HandlerError::Permanent(e.to_string()))?;

        let changes = match event {
            BillEvent::Created(e) => self.stage(BillSummaryRow {
                bill_id: e.bill_id,
                title: e.title,
                total: e.total,
                created_by: e.created_by,
                status: BillStatus::Created,
                created_at: record.timestamp,
                updated_at: record.timestamp,
                file_count: 0,
                ocr_text: None,
                ocr_total: None,
                ocr_title: None,
                ocr_confidence: None,
                approver_id: None,
                decision: None,
                approval_reason: None,
                decided_at: None,
                last_sequence: record.sequence,
            }),
            BillEvent::FileAttached(e) => match self.current(&e.bill_id)? {
                None => self.missing_row(record),
                Some(mut row) => {
                    row.file_count += 1;
                    if row.status == BillStatus::Created {
                        row.status = BillStatus::FileAttached;
                    }
                    row.updated_at = record.timestamp;
                    row.last_sequence = record.sequence;
                    self.stage(row)
                }
            },
            BillEvent::OcrCompleted(e) => match self.current(&e.bill_id)? {
                None => self.missing_row(record),
                Some(mut row) => {
                    row.ocr_text = Some(e.extracted_text);
                    row.ocr_total = e.extracted_total;
                    row.ocr_title = e.extracted_title;
                    row.ocr_confidence = Some(e.confidence);
                    if row.status == BillStatus::FileAttached {
                        row.status = BillStatus::Processed;
                    }
                    row.updated_at = record.timestamp;
                    row.last_sequence = record.sequence;
                    self.stage(row)
                }
            },
            BillEvent::Approved(e) => match self.current(&e.bill_id)? {
                None => self.missing_row(record),
                Some(mut row) => {
                    row.status = match e.decision {
                        ApprovalDecision::Approved => BillStatus::Approved,
                        ApprovalDecision::Rejected => BillStatus::Rejected,
                    };
                    row.approver_id = Some(e.approver_id);
                    row.decision = Some(e.decision);
                    row.approval_reason = Some(e.reason);
                    row.decided_at = Some(record.timestamp);
                    row.updated_at = record.timestamp;
                    row.last_sequence = record.sequence;
                    self.stage(row)
                }
            },
            // Neither changes the summary: a request is operational, a
            // failure leaves the bill retriable.
            BillEvent::OcrRequested(_) | BillEvent::OcrFailed(_) => vec![],
        };

        Ok(changes)
    }

    fn on_reset(&mut self) {
        self.rows.clear();
    }
}
