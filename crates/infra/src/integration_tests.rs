//! Integration tests for the full event-sourced pipeline.
//!
//! Command → Router → Event Log → {projections, reactive handlers} → read
//! model, all in-memory.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use billflow_billing::{
    ApplyOcrResult, ApprovalDecision, ApproveBill, AttachFile, BillCommand, BillStatus, CreateBill,
};
use billflow_core::{BillId, Clock, FileId, FixedClock, RejectionCode};

use crate::adapters::{
    BlobStore, InMemoryBlobStore, OcrError, OcrExtraction, OcrService, RecordingNotifier,
};
use crate::config::{ConsumerConfig, FilePolicy, RouterConfig};
use crate::consumer::LogConsumer;
use crate::error::ServiceError;
use crate::event_log::{EventLog, InMemoryEventLog};
use crate::projections::{BILL_SUMMARY, BillFilesProjection, BillSummaryProjection};
use crate::query::QueryService;
use crate::reactive::{NotificationHandler, OcrOrchestrator, OCR_ORCHESTRATOR};
use crate::read_model::{InMemoryReadModelStore, ReadModelStore};
use crate::router::CommandRouter;

/// OCR double that replays a script of responses, then succeeds.
struct ScriptedOcr {
    script: Mutex<VecDeque<Result<OcrExtraction, OcrError>>>,
    calls: AtomicU32,
}

impl ScriptedOcr {
    fn succeeding() -> Self {
        Self::with_script(vec![])
    }

    fn with_script(script: Vec<Result<OcrExtraction, OcrError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn default_extraction() -> OcrExtraction {
        OcrExtraction {
            text: "AMOUNT DUE $150.00".to_string(),
            total: Some(dec!(150.00)),
            title: Some("Electric Utility".to_string()),
            confidence: "95%".to_string(),
            processing_time: "1.2s".to_string(),
        }
    }
}

impl OcrService for ScriptedOcr {
    fn extract(
        &self,
        _bytes: &[u8],
        _content_type: &str,
        _filename: &str,
    ) -> Result<OcrExtraction, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::default_extraction()))
    }
}

struct Pipeline {
    log: Arc<InMemoryEventLog>,
    router: Arc<CommandRouter<Arc<InMemoryEventLog>>>,
    store: Arc<InMemoryReadModelStore>,
    blob: Arc<InMemoryBlobStore>,
    ocr: Arc<ScriptedOcr>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<FixedClock>,
    config: ConsumerConfig,
}

impl Pipeline {
    fn new(ocr: ScriptedOcr) -> Self {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let log = Arc::new(InMemoryEventLog::new());
        let router = Arc::new(CommandRouter::new(
            log.clone(),
            RouterConfig::default(),
            FilePolicy::permissive(),
        ));
        Self {
            log,
            router,
            store: Arc::new(InMemoryReadModelStore::new()),
            blob: Arc::new(InMemoryBlobStore::new(
                "http://localhost/blobs",
                clock.clone() as Arc<dyn Clock>,
            )),
            ocr: Arc::new(ocr),
            notifier: Arc::new(RecordingNotifier::new()),
            clock,
            config: ConsumerConfig::default(),
        }
    }

    fn create(&self, bill: &str, title: &str, total: Decimal) {
        self.router
            .dispatch(
                BillCommand::CreateBill(CreateBill {
                    bill_id: BillId::new(bill).unwrap(),
                    title: title.to_string(),
                    total,
                    metadata: BTreeMap::new(),
                    created_by: "u1".to_string(),
                    occurred_at: self.clock.now(),
                }),
                "u1",
            )
            .unwrap();
    }

    fn attach(&self, bill: &str, file: &str, bytes: &[u8]) {
        let key = format!("bills/{bill}/{file}/{file}.pdf");
        let checksum = self.blob.put(&key, bytes, "application/pdf").unwrap();
        self.router
            .dispatch(
                BillCommand::AttachFile(AttachFile {
                    bill_id: BillId::new(bill).unwrap(),
                    file_id: FileId::new(file).unwrap(),
                    filename: format!("{file}.pdf"),
                    content_type: "application/pdf".to_string(),
                    size_bytes: bytes.len() as u64,
                    storage_key: key,
                    checksum,
                    occurred_at: self.clock.now(),
                }),
                "u1",
            )
            .unwrap();
    }

    fn approve(&self, bill: &str, approver: &str) -> Result<(), ServiceError> {
        self.router
            .dispatch(
                BillCommand::ApproveBill(ApproveBill {
                    bill_id: BillId::new(bill).unwrap(),
                    approver_id: approver.to_string(),
                    decision: ApprovalDecision::Approved,
                    reason: "ok".to_string(),
                    occurred_at: self.clock.now(),
                }),
                approver,
            )
            .map(|_| ())
    }

    fn run_reactive(&self) {
        let mut orchestrator = OcrOrchestrator::new(
            self.log.clone(),
            self.router.clone(),
            self.blob.clone(),
            self.ocr.clone(),
            self.clock.clone() as Arc<dyn Clock>,
            3,
        );
        LogConsumer::drain(&*self.log, &*self.store, &mut orchestrator, &self.config).unwrap();
    }

    fn run_projections(&self) {
        let mut summary = BillSummaryProjection::new(self.store.clone());
        LogConsumer::drain(&*self.log, &*self.store, &mut summary, &self.config).unwrap();
        let mut files = BillFilesProjection::new();
        LogConsumer::drain(&*self.log, &*self.store, &mut files, &self.config).unwrap();
    }

    fn run_notifier(&self) {
        let mut handler = NotificationHandler::new(
            self.notifier.clone(),
            vec!["ops@example.com".to_string()],
        );
        LogConsumer::drain(&*self.log, &*self.store, &mut handler, &self.config).unwrap();
    }

    fn kinds(&self, bill: &str) -> Vec<String> {
        self.log
            .read_entity(&BillId::new(bill).unwrap(), 0)
            .unwrap()
            .into_iter()
            .map(|r| r.kind)
            .collect()
    }

    fn query(&self) -> QueryService<Arc<InMemoryReadModelStore>, Arc<InMemoryBlobStore>> {
        QueryService::new(self.store.clone(), self.blob.clone(), Duration::from_secs(900))
    }
}

#[test]
fn happy_path_produces_five_events_and_an_approved_row() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());

    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 1024]);
    pipeline.run_reactive();
    pipeline.approve("b1", "u1").unwrap();
    pipeline.run_projections();
    pipeline.run_notifier();

    assert_eq!(
        pipeline.kinds("b1"),
        vec!["BillCreated", "FileAttached", "OcrRequested", "OcrCompleted", "BillApproved"]
    );

    let details = pipeline.query().get_bill(&BillId::new("b1").unwrap()).unwrap();
    assert_eq!(details.summary.row.status, BillStatus::Approved);
    assert_eq!(details.summary.effective_title, "Electric Utility");
    assert_eq!(details.summary.effective_total, dec!(150.00));
    assert_eq!(details.files.len(), 1);
    assert!(details.files[0].download_url.as_deref().unwrap().contains("bills/b1/f1"));

    let sent = pipeline.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].template, "bill-processed");
    assert_eq!(sent[1].template, "bill-approved");
}

#[test]
fn approve_before_ocr_rejects_and_appends_nothing() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());

    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 64]);

    let err = pipeline.approve("b1", "u1").unwrap_err();
    assert!(matches!(
        err,
        ServiceError::BusinessRuleViolation {
            code: RejectionCode::StatusNotProcessedForApproval,
            ..
        }
    ));
    assert_eq!(
        pipeline.kinds("b1"),
        vec!["BillCreated", "FileAttached", "OcrRequested"]
    );
}

#[test]
fn concurrent_approvals_commit_exactly_one_decision() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());
    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 64]);
    pipeline.run_reactive();

    let pipeline = Arc::new(pipeline);
    let results: Vec<_> = ["u1", "u2"]
        .map(|approver| {
            let pipeline = pipeline.clone();
            let approver = approver.to_string();
            std::thread::spawn(move || pipeline.approve("b1", &approver))
        })
        .into_iter()
        .map(|join| join.join().unwrap())
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
    assert!(matches!(
        loser,
        ServiceError::BusinessRuleViolation {
            code: RejectionCode::StatusNotProcessedForApproval,
            ..
        } | ServiceError::ConcurrencyConflict(_)
    ));

    let approvals = pipeline
        .kinds("b1")
        .into_iter()
        .filter(|k| k == "BillApproved")
        .count();
    assert_eq!(approvals, 1);
}

#[test]
fn ocr_replacement_records_both_and_reads_latest() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());
    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 64]);
    pipeline.run_reactive();

    // Correction run with a different extraction.
    pipeline
        .router
        .dispatch(
            BillCommand::ApplyOcrResult(ApplyOcrResult {
                bill_id: BillId::new("b1").unwrap(),
                extracted_text: "corrected".to_string(),
                extracted_total: Some(dec!(151.25)),
                extracted_title: Some("Electric (corrected)".to_string()),
                confidence: "99%".to_string(),
                processing_time: "0.4s".to_string(),
                occurred_at: pipeline.clock.now(),
            }),
            "ops",
        )
        .unwrap();
    pipeline.run_projections();

    let completions = pipeline
        .kinds("b1")
        .into_iter()
        .filter(|k| k == "OcrCompleted")
        .count();
    assert_eq!(completions, 2);

    let row = pipeline.store.summary(&BillId::new("b1").unwrap()).unwrap().unwrap();
    assert_eq!(row.ocr_title.as_deref(), Some("Electric (corrected)"));
    assert_eq!(row.ocr_total, Some(dec!(151.25)));
}

#[test]
fn duplicate_ocr_requests_are_skipped_via_entity_state() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());
    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 64]);
    pipeline.run_reactive();
    assert_eq!(pipeline.ocr.calls(), 1);

    // Redeliver everything to the orchestrator, as after a token reset that
    // did not reset downstream state.
    pipeline.store.reset(OCR_ORCHESTRATOR).unwrap();
    pipeline.run_reactive();

    assert_eq!(pipeline.ocr.calls(), 1);
    let completions = pipeline
        .kinds("b1")
        .into_iter()
        .filter(|k| k == "OcrCompleted")
        .count();
    assert_eq!(completions, 1);
}

#[test]
fn rejected_ocr_is_recorded_then_retried_to_success() {
    let pipeline = Pipeline::new(ScriptedOcr::with_script(vec![Err(OcrError::Rejected {
        kind: "unreadable".to_string(),
        message: "image too dark".to_string(),
    })]));
    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 64]);

    // One drain carries the whole chain: request → failure recorded →
    // bounded retry → completion.
    pipeline.run_reactive();

    let kinds = pipeline.kinds("b1");
    assert_eq!(
        kinds,
        vec!["BillCreated", "FileAttached", "OcrRequested", "OcrFailed", "OcrCompleted"]
    );
    assert_eq!(pipeline.ocr.calls(), 2);

    pipeline.run_projections();
    let row = pipeline.store.summary(&BillId::new("b1").unwrap()).unwrap().unwrap();
    assert_eq!(row.status, BillStatus::Processed);
}

#[test]
fn projection_replay_reproduces_the_read_model() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());

    for i in 0..100 {
        let bill = format!("bill-{i:03}");
        pipeline.create(&bill, &format!("Bill {i}"), Decimal::from(i + 1));
        pipeline.attach(&bill, "f1", &[0u8; 32]);
    }
    pipeline.run_reactive();
    pipeline.run_projections();

    assert!(pipeline.log.current_position().unwrap() >= 400);

    let mut before = pipeline.store.summaries().unwrap();
    before.sort_by(|a, b| a.bill_id.cmp(&b.bill_id));
    assert_eq!(before.len(), 100);

    let mut summary = BillSummaryProjection::new(pipeline.store.clone());
    LogConsumer::replay(&*pipeline.log, &*pipeline.store, &mut summary, &pipeline.config).unwrap();

    let mut after = pipeline.store.summaries().unwrap();
    after.sort_by(|a, b| a.bill_id.cmp(&b.bill_id));

    assert_eq!(before, after);
    assert_eq!(
        pipeline.store.tracking_position(BILL_SUMMARY).unwrap(),
        pipeline.log.current_position().unwrap()
    );
}

#[test]
fn live_consumers_follow_the_log() {
    let pipeline = Pipeline::new(ScriptedOcr::succeeding());

    let orchestrator = OcrOrchestrator::new(
        pipeline.log.clone(),
        pipeline.router.clone(),
        pipeline.blob.clone(),
        pipeline.ocr.clone(),
        pipeline.clock.clone() as Arc<dyn Clock>,
        3,
    );
    let summary = BillSummaryProjection::new(pipeline.store.clone());

    let fast = ConsumerConfig {
        poll_interval: Duration::from_millis(10),
        ..ConsumerConfig::default()
    };
    let ocr_handle =
        LogConsumer::spawn(pipeline.log.clone(), pipeline.store.clone(), orchestrator, fast);
    let summary_handle =
        LogConsumer::spawn(pipeline.log.clone(), pipeline.store.clone(), summary, fast);

    pipeline.create("b1", "Electric", dec!(150.00));
    pipeline.attach("b1", "f1", &[0u8; 64]);

    let bill_id = BillId::new("b1").unwrap();
    wait_until(|| {
        pipeline
            .store
            .summary(&bill_id)
            .unwrap()
            .is_some_and(|row| row.status == BillStatus::Processed)
    });

    pipeline.approve("b1", "u1").unwrap();
    wait_until(|| {
        pipeline
            .store
            .summary(&bill_id)
            .unwrap()
            .is_some_and(|row| row.status == BillStatus::Approved)
    });

    ocr_handle.shutdown();
    summary_handle.shutdown();
}

fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within timeout");
}
