//! OCR orchestration: `OcrRequested` → blob fetch → OCR call →
//! `ApplyOcrResult` or `MarkOcrFailed`, with bounded automatic retry after a
//! recorded failure.

use std::sync::Arc;

use tracing::{debug, info, warn};

use billflow_billing::{
    ApplyOcrResult, Bill, BillCommand, BillEvent, BillStatus, MarkOcrFailed, codec,
};
use billflow_core::{Aggregate, BillId, Clock, FileId};
use billflow_events::EventRecord;

use crate::adapters::{BlobError, BlobStore, OcrError, OcrService};
use crate::consumer::{HandlerError, LogHandler};
use crate::error::ServiceError;
use crate::event_log::EventLog;
use crate::read_model::RowChange;
use crate::router::CommandRouter;
use crate::util::BackoffPolicy;

use super::OCR_ORCHESTRATOR;

const CALL_ATTEMPTS: u32 = 3;

/// The OCR reactive consumer.
///
/// Idempotency: before doing any work the handler replays the entity's
/// stream from the log — never the read model, which may lag — and skips
/// when a newer `OcrCompleted`/`OcrFailed` already settled the request.
pub struct OcrOrchestrator<L, B, O> {
    log: L,
    router: Arc<CommandRouter<L>>,
    blob: B,
    ocr: O,
    clock: Arc<dyn Clock>,
    /// Cap on automatic re-runs counted from `OcrFailed` events in the
    /// stream.
    max_attempts: u32,
    backoff: BackoffPolicy,
}

struct OcrJob {
    bill_id: BillId,
    file_id: FileId,
    filename: String,
    content_type: String,
    storage_key: String,
    /// Sequence of the event that triggered this job; anything newer
    /// settles it.
    triggered_at_sequence: u64,
}

impl<L, B, O> OcrOrchestrator<L, B, O>
where
    L: EventLog,
    B: BlobStore,
    O: OcrService,
{
    pub fn new(
        log: L,
        router: Arc<CommandRouter<L>>,
        blob: B,
        ocr: O,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            log,
            router,
            blob,
            ocr,
            clock,
            max_attempts: max_attempts.max(1),
            backoff: BackoffPolicy::default(),
        }
    }

    fn load_bill(&self, bill_id: &BillId) -> Result<(Bill, Vec<BillEvent>), HandlerError> {
        let records = self
            .log
            .read_entity(bill_id, 0)
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        let mut bill = Bill::empty(bill_id.clone());
        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            let event =
                codec::decode_record(record).map_err(|e| HandlerError::Permanent(e.to_string()))?;
            bill.apply(&event);
            events.push(event);
        }
        Ok((bill, events))
    }

    /// A job is settled when anything completed or failed OCR after its
    /// trigger, or the bill left the OCR-able part of its lifecycle.
    fn is_settled(&self, bill: &Bill, events: &[BillEvent], job: &OcrJob) -> bool {
        if bill.status().is_terminal() {
            return true;
        }
        events
            .iter()
            .enumerate()
            .any(|(sequence, event)| {
                sequence as u64 > job.triggered_at_sequence
                    && matches!(event, BillEvent::OcrCompleted(_) | BillEvent::OcrFailed(_))
            })
    }

    fn run_job(&self, job: &OcrJob) -> Result<(), HandlerError> {
        let (bill, events) = self.load_bill(&job.bill_id)?;

        if self.is_settled(&bill, &events, job) {
            debug!(bill_id = %job.bill_id, file_id = %job.file_id, "ocr request already settled, skipping");
            return Ok(());
        }

        let bytes = match self.blob.get(&job.storage_key) {
            Ok(bytes) => bytes,
            Err(e @ BlobError::Unavailable(_)) => {
                return Err(HandlerError::Transient(e.to_string()));
            }
            Err(BlobError::NotFound(key)) => {
                // The key is event-referenced, so this is an operational
                // defect; record it as a failed OCR rather than stalling.
                warn!(bill_id = %job.bill_id, storage_key = %key, "blob missing for ocr request");
                return self.dispatch_failed(job, "blob_missing", &format!("no blob at {key}"));
            }
        };

        match self.call_ocr(&bytes, job) {
            Ok(extraction) => self.dispatch_result(job, extraction),
            Err(OcrError::Rejected { kind, message }) => {
                self.dispatch_failed(job, &kind, &message)
            }
            Err(OcrError::Transient(message)) => {
                // In-call retries exhausted; record the failure. The
                // OcrFailed handler drives bounded re-runs.
                self.dispatch_failed(job, "transient_exhausted", &message)
            }
        }
    }

    fn call_ocr(
        &self,
        bytes: &[u8],
        job: &OcrJob,
    ) -> Result<crate::adapters::OcrExtraction, OcrError> {
        let mut attempt = 0u32;
        loop {
            match self.ocr.extract(bytes, &job.content_type, &job.filename) {
                Err(e) if e.is_transient() && attempt + 1 < CALL_ATTEMPTS => {
                    warn!(bill_id = %job.bill_id, attempt, error = %e, "ocr call failed, retrying");
                    self.backoff.sleep(attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn dispatch_result(
        &self,
        job: &OcrJob,
        extraction: crate::adapters::OcrExtraction,
    ) -> Result<(), HandlerError> {
        let command = BillCommand::ApplyOcrResult(ApplyOcrResult {
            bill_id: job.bill_id.clone(),
            extracted_text: extraction.text,
            extracted_total: extraction.total,
            extracted_title: extraction.title,
            confidence: extraction.confidence,
            processing_time: extraction.processing_time,
            occurred_at: self.clock.now(),
        });
        self.dispatch(command)
    }

    fn dispatch_failed(&self, job: &OcrJob, kind: &str, message: &str) -> Result<(), HandlerError> {
        let command = BillCommand::MarkOcrFailed(MarkOcrFailed {
            bill_id: job.bill_id.clone(),
            error_kind: kind.to_string(),
            message: message.to_string(),
            occurred_at: self.clock.now(),
        });
        self.dispatch(command)
    }

    fn dispatch(&self, command: BillCommand) -> Result<(), HandlerError> {
        match self.router.dispatch(command, OCR_ORCHESTRATOR) {
            Ok(_) => Ok(()),
            // The entity moved on (another worker won, approval landed):
            // duplicate-safe, drop.
            Err(ServiceError::BusinessRuleViolation { code, message }) => {
                debug!(code = %code, message = %message, "ocr command superseded by entity state");
                Ok(())
            }
            Err(ServiceError::ConcurrencyConflict(message)) => {
                Err(HandlerError::Transient(message))
            }
            Err(ServiceError::TransientFailure(message)) => {
                Err(HandlerError::Transient(message))
            }
            Err(e) => Err(HandlerError::Permanent(e.to_string())),
        }
    }

    /// Bounded automatic retry after a recorded failure: re-run the latest
    /// file while the stream holds fewer than `max_attempts` failures.
    fn handle_failure(&self, record: &EventRecord) -> Result<(), HandlerError> {
        let (bill, _) = self.load_bill(&record.entity_id)?;

        if bill.status() != BillStatus::FileAttached {
            return Ok(());
        }
        if bill.ocr_failures() >= self.max_attempts {
            info!(
                bill_id = %record.entity_id,
                failures = bill.ocr_failures(),
                "ocr retry budget exhausted, leaving bill retriable by hand"
            );
            return Ok(());
        }
        let Some(file) = bill.files().last() else {
            return Ok(());
        };

        info!(
            bill_id = %record.entity_id,
            attempt = bill.ocr_failures(),
            "retrying ocr after recorded failure"
        );
        self.run_job(&OcrJob {
            bill_id: record.entity_id.clone(),
            file_id: file.file_id.clone(),
            filename: file.filename.clone(),
            content_type: file.content_type.clone(),
            storage_key: file.storage_key.clone(),
            triggered_at_sequence: record.sequence,
        })
    }
}

impl<L, B, O> LogHandler for OcrOrchestrator<L, B, O>
where
    L: EventLog,
    B: BlobStore,
    O: OcrService,
{
    fn consumer_name(&self) -> &'static str {
        OCR_ORCHESTRATOR
    }

    fn handle(&mut self, record: &EventRecord) -> Result<Vec<RowChange>, HandlerError> {
        match record.kind.as_str() {
            codec::OCR_REQUESTED => {
                let request = codec::decode_ocr_requested(record)
                    .map_err(|e| HandlerError::Permanent(e.to_string()))?;
                self.run_job(&OcrJob {
                    bill_id: request.bill_id,
                    file_id: request.file_id,
                    filename: request.filename,
                    content_type: request.content_type,
                    storage_key: request.storage_key,
                    triggered_at_sequence: record.sequence,
                })?;
            }
            codec::OCR_FAILED => {
                self.handle_failure(record)?;
            }
            _ => {}
        }
        Ok(vec![])
    }
}
