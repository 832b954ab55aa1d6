//! `bill-files` projection: one row per attached file.

use billflow_billing::{BillEvent, codec};
use billflow_events::EventRecord;

use crate::consumer::{HandlerError, LogHandler};
use crate::read_model::{BillFileRow, RowChange};

use super::BILL_FILES;

/// Projection handler for the bill files table. Insert-only: a file, once
/// attached, is immutable, so the upsert is trivially idempotent.
#[derive(Debug, Default)]
pub struct BillFilesProjection;

impl BillFilesProjection {
    pub fn new() -> Self {
        Self
    }
}

impl LogHandler for BillFilesProjection {
    fn consumer_name(&self) -> &'static str {
        BILL_FILES
    }

    fn handle(&mut self, record: &EventRecord) -> Result<Vec<RowChange>, HandlerError> {
        let event =
            codec::decode_record(record).map_err(|e| HandlerError::Permanent(e.to_string()))?;

        let changes = match event {
            BillEvent::FileAttached(e) => vec![RowChange::UpsertFile(BillFileRow {
                bill_id: e.bill_id,
                file_id: e.file_id,
                filename: e.filename,
                content_type: e.content_type,
                size_bytes: e.size_bytes,
                storage_key: e.storage_key,
                checksum: e.checksum,
                attached_at: record.timestamp,
            })],
            _ => vec![],
        };

        Ok(changes)
    }
}
