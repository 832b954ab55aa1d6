//! The Bill aggregate: commands, events, and the pure fold.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_core::money;
use billflow_core::{Aggregate, AggregateRoot, BillId, DomainError, FileId, RejectionCode};
use billflow_events::Event;

/// Bill status lifecycle.
///
/// `Created → FileAttached → Processed → Approved | Rejected`; `Approved` and
/// `Rejected` are terminal. An OCR failure does not advance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Created,
    FileAttached,
    Processed,
    Approved,
    Rejected,
}

impl BillStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BillStatus::Approved | BillStatus::Rejected)
    }
}

/// Approval outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// An attached file. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Opaque reference into the blob store; stays valid as long as any
    /// event references it.
    pub storage_key: String,
    /// Hex digest of the stored bytes.
    pub checksum: String,
    pub attached_at: DateTime<Utc>,
}

/// Latest OCR extraction for a bill. Replacement is allowed; latest wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrResult {
    pub extracted_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_total: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_title: Option<String>,
    pub confidence: String,
    pub processing_time: String,
}

/// Recorded approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver_id: String,
    pub decision: ApprovalDecision,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

// -------------------------
// Commands
// -------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBill {
    pub bill_id: BillId,
    pub title: String,
    pub total: Decimal,
    /// Free-form creation metadata, opaque to the core.
    pub metadata: BTreeMap<String, String>,
    pub created_by: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachFile {
    pub bill_id: BillId,
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub checksum: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOcrResult {
    pub bill_id: BillId,
    pub extracted_text: String,
    pub extracted_total: Option<Decimal>,
    pub extracted_title: Option<String>,
    pub confidence: String,
    pub processing_time: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOcrFailed {
    pub bill_id: BillId,
    pub error_kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveBill {
    pub bill_id: BillId,
    pub approver_id: String,
    pub decision: ApprovalDecision,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillCommand {
    CreateBill(CreateBill),
    AttachFile(AttachFile),
    ApplyOcrResult(ApplyOcrResult),
    MarkOcrFailed(MarkOcrFailed),
    ApproveBill(ApproveBill),
}

impl BillCommand {
    /// The entity this command is addressed to.
    pub fn bill_id(&self) -> &BillId {
        match self {
            BillCommand::CreateBill(c) => &c.bill_id,
            BillCommand::AttachFile(c) => &c.bill_id,
            BillCommand::ApplyOcrResult(c) => &c.bill_id,
            BillCommand::MarkOcrFailed(c) => &c.bill_id,
            BillCommand::ApproveBill(c) => &c.bill_id,
        }
    }
}

// -------------------------
// Events
// -------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillCreated {
    pub bill_id: BillId,
    pub title: String,
    pub total: Decimal,
    pub metadata: BTreeMap<String, String>,
    pub created_by: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttached {
    pub bill_id: BillId,
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub checksum: String,
    pub occurred_at: DateTime<Utc>,
}

/// Carries everything the OCR orchestrator needs so it never has to join
/// back to the `FileAttached` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrRequested {
    pub bill_id: BillId,
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub storage_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrCompleted {
    pub bill_id: BillId,
    pub extracted_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_total: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_title: Option<String>,
    pub confidence: String,
    pub processing_time: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrFailed {
    pub bill_id: BillId,
    pub error_kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillApproved {
    pub bill_id: BillId,
    pub approver_id: String,
    pub decision: ApprovalDecision,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Tagged union of bill events. Wire encoding goes through [`crate::codec`]
/// (one explicit case per kind), never through serde on this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillEvent {
    Created(BillCreated),
    FileAttached(FileAttached),
    OcrRequested(OcrRequested),
    OcrCompleted(OcrCompleted),
    OcrFailed(OcrFailed),
    Approved(BillApproved),
}

impl Event for BillEvent {
    fn kind(&self) -> &'static str {
        match self {
            BillEvent::Created(_) => crate::codec::BILL_CREATED,
            BillEvent::FileAttached(_) => crate::codec::FILE_ATTACHED,
            BillEvent::OcrRequested(_) => crate::codec::OCR_REQUESTED,
            BillEvent::OcrCompleted(_) => crate::codec::OCR_COMPLETED,
            BillEvent::OcrFailed(_) => crate::codec::OCR_FAILED,
            BillEvent::Approved(_) => crate::codec::BILL_APPROVED,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BillEvent::Created(e) => e.occurred_at,
            BillEvent::FileAttached(e) => e.occurred_at,
            BillEvent::OcrRequested(e) => e.occurred_at,
            BillEvent::OcrCompleted(e) => e.occurred_at,
            BillEvent::OcrFailed(e) => e.occurred_at,
            BillEvent::Approved(e) => e.occurred_at,
        }
    }
}

impl BillEvent {
    pub fn bill_id(&self) -> &BillId {
        match self {
            BillEvent::Created(e) => &e.bill_id,
            BillEvent::FileAttached(e) => &e.bill_id,
            BillEvent::OcrRequested(e) => &e.bill_id,
            BillEvent::OcrCompleted(e) => &e.bill_id,
            BillEvent::OcrFailed(e) => &e.bill_id,
            BillEvent::Approved(e) => &e.bill_id,
        }
    }
}

// -------------------------
// Aggregate
// -------------------------

/// Aggregate root: one bill, one consistency boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bill {
    id: BillId,
    title: String,
    total: Decimal,
    metadata: BTreeMap<String, String>,
    created_by: String,
    status: BillStatus,
    files: Vec<FileRecord>,
    ocr: Option<OcrResult>,
    approval: Option<ApprovalRecord>,
    created_at: Option<DateTime<Utc>>,
    ocr_failures: u32,
    version: u64,
    created: bool,
}

impl Bill {
    /// Create an empty, not-yet-created instance for rehydration.
    pub fn empty(id: BillId) -> Self {
        Self {
            id,
            title: String::new(),
            total: Decimal::ZERO,
            metadata: BTreeMap::new(),
            created_by: String::new(),
            status: BillStatus::Created,
            files: Vec::new(),
            ocr: None,
            approval: None,
            created_at: None,
            ocr_failures: 0,
            version: 0,
            created: false,
        }
    }

    /// Rehydrate a bill by folding an ordered event stream.
    pub fn replay<'a>(id: BillId, events: impl IntoIterator<Item = &'a BillEvent>) -> Self {
        let mut bill = Self::empty(id);
        for event in events {
            bill.apply(event);
        }
        bill
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn status(&self) -> BillStatus {
        self.status
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn ocr(&self) -> Option<&OcrResult> {
        self.ocr.as_ref()
    }

    pub fn approval(&self) -> Option<&ApprovalRecord> {
        self.approval.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Count of recorded OCR failures, used to bound automatic retries.
    pub fn ocr_failures(&self) -> u32 {
        self.ocr_failures
    }
}

impl AggregateRoot for Bill {
    type Id = BillId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for Bill {
    type Command = BillCommand;
    type Event = BillEvent;
    type Error = DomainError;

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BillCommand::CreateBill(cmd) => self.handle_create(cmd),
            BillCommand::AttachFile(cmd) => self.handle_attach(cmd),
            BillCommand::ApplyOcrResult(cmd) => self.handle_apply_ocr(cmd),
            BillCommand::MarkOcrFailed(cmd) => self.handle_ocr_failed(cmd),
            BillCommand::ApproveBill(cmd) => self.handle_approve(cmd),
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BillEvent::Created(e) => {
                self.id = e.bill_id.clone();
                self.title = e.title.clone();
                self.total = e.total;
                self.metadata = e.metadata.clone();
                self.created_by = e.created_by.clone();
                self.status = BillStatus::Created;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            BillEvent::FileAttached(e) => {
                self.files.push(FileRecord {
                    file_id: e.file_id.clone(),
                    filename: e.filename.clone(),
                    content_type: e.content_type.clone(),
                    size_bytes: e.size_bytes,
                    storage_key: e.storage_key.clone(),
                    checksum: e.checksum.clone(),
                    attached_at: e.occurred_at,
                });
                if self.status == BillStatus::Created {
                    self.status = BillStatus::FileAttached;
                }
            }
            BillEvent::OcrRequested(_) => {}
            BillEvent::OcrCompleted(e) => {
                self.ocr = Some(OcrResult {
                    extracted_text: e.extracted_text.clone(),
                    extracted_total: e.extracted_total,
                    extracted_title: e.extracted_title.clone(),
                    confidence: e.confidence.clone(),
                    processing_time: e.processing_time.clone(),
                });
                if self.status == BillStatus::FileAttached {
                    self.status = BillStatus::Processed;
                }
            }
            BillEvent::OcrFailed(_) => {
                self.ocr_failures += 1;
            }
            BillEvent::Approved(e) => {
                self.approval = Some(ApprovalRecord {
                    approver_id: e.approver_id.clone(),
                    decision: e.decision,
                    reason: e.reason.clone(),
                    decided_at: e.occurred_at,
                });
                self.status = match e.decision {
                    ApprovalDecision::Approved => BillStatus::Approved,
                    ApprovalDecision::Rejected => BillStatus::Rejected,
                };
            }
        }

        // Deterministic version tracking: +1 per applied event, so version
        // doubles as the next unused sequence number.
        self.version += 1;
    }
}

impl Bill {
    fn ensure_bill_id(&self, bill_id: &BillId) -> Result<(), DomainError> {
        if &self.id != bill_id {
            return Err(DomainError::rejected(
                RejectionCode::IdMismatch,
                "command addresses a different bill id",
            ));
        }
        Ok(())
    }

    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::rejected(
                RejectionCode::BillNotFound,
                "bill does not exist",
            ));
        }
        Ok(())
    }

    fn ensure_not_terminal(&self) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::rejected(
                RejectionCode::BillTerminal,
                format!("bill is terminal ({:?})", self.status),
            ));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateBill) -> Result<Vec<BillEvent>, DomainError> {
        self.ensure_bill_id(&cmd.bill_id)?;

        if self.created {
            return Err(DomainError::rejected(
                RejectionCode::BillAlreadyExists,
                "bill already exists",
            ));
        }

        let title = cmd.title.trim();
        if title.is_empty() {
            return Err(DomainError::rejected(
                RejectionCode::TitleRequired,
                "title must not be empty",
            ));
        }

        let total = money::validate_total(cmd.total)?;

        Ok(vec![BillEvent::Created(BillCreated {
            bill_id: cmd.bill_id.clone(),
            title: title.to_string(),
            total,
            metadata: cmd.metadata.clone(),
            created_by: cmd.created_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_attach(&self, cmd: &AttachFile) -> Result<Vec<BillEvent>, DomainError> {
        self.ensure_bill_id(&cmd.bill_id)?;
        self.ensure_exists()?;
        self.ensure_not_terminal()?;

        if cmd.filename.trim().is_empty() {
            return Err(DomainError::rejected(
                RejectionCode::FileNameRequired,
                "filename must not be empty",
            ));
        }
        if cmd.size_bytes == 0 {
            return Err(DomainError::rejected(
                RejectionCode::FileSizeInvalid,
                "file size must be positive",
            ));
        }
        if self.files.iter().any(|f| f.file_id == cmd.file_id) {
            return Err(DomainError::rejected(
                RejectionCode::FileAlreadyAttached,
                format!("file {} is already attached", cmd.file_id),
            ));
        }

        let attached = BillEvent::FileAttached(FileAttached {
            bill_id: cmd.bill_id.clone(),
            file_id: cmd.file_id.clone(),
            filename: cmd.filename.clone(),
            content_type: cmd.content_type.clone(),
            size_bytes: cmd.size_bytes,
            storage_key: cmd.storage_key.clone(),
            checksum: cmd.checksum.clone(),
            occurred_at: cmd.occurred_at,
        });

        // A file attached before processing triggers OCR; one attached to an
        // already-processed bill does not re-run it.
        let mut events = vec![attached];
        if matches!(self.status, BillStatus::Created | BillStatus::FileAttached) {
            events.push(BillEvent::OcrRequested(OcrRequested {
                bill_id: cmd.bill_id.clone(),
                file_id: cmd.file_id.clone(),
                filename: cmd.filename.clone(),
                content_type: cmd.content_type.clone(),
                storage_key: cmd.storage_key.clone(),
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_apply_ocr(&self, cmd: &ApplyOcrResult) -> Result<Vec<BillEvent>, DomainError> {
        self.ensure_bill_id(&cmd.bill_id)?;
        self.ensure_exists()?;
        self.ensure_not_terminal()?;

        if self.files.is_empty()
            || !matches!(self.status, BillStatus::FileAttached | BillStatus::Processed)
        {
            return Err(DomainError::rejected(
                RejectionCode::NoFileAttachedForOcr,
                "OCR results require an attached file awaiting or past processing",
            ));
        }

        // Absent is preferred over empty: normalize before recording.
        let extracted_title = cmd
            .extracted_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let extracted_total = cmd.extracted_total.map(money::round_extracted);

        Ok(vec![BillEvent::OcrCompleted(OcrCompleted {
            bill_id: cmd.bill_id.clone(),
            extracted_text: cmd.extracted_text.clone(),
            extracted_total,
            extracted_title,
            confidence: cmd.confidence.clone(),
            processing_time: cmd.processing_time.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_ocr_failed(&self, cmd: &MarkOcrFailed) -> Result<Vec<BillEvent>, DomainError> {
        self.ensure_bill_id(&cmd.bill_id)?;
        self.ensure_exists()?;
        self.ensure_not_terminal()?;

        if self.status != BillStatus::FileAttached {
            return Err(DomainError::rejected(
                RejectionCode::StatusNotAttachedForOcrFailure,
                format!("OCR failure applies only to FileAttached bills, not {:?}", self.status),
            ));
        }

        Ok(vec![BillEvent::OcrFailed(OcrFailed {
            bill_id: cmd.bill_id.clone(),
            error_kind: cmd.error_kind.clone(),
            message: cmd.message.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveBill) -> Result<Vec<BillEvent>, DomainError> {
        self.ensure_bill_id(&cmd.bill_id)?;
        self.ensure_exists()?;

        if self.status != BillStatus::Processed {
            return Err(DomainError::rejected(
                RejectionCode::StatusNotProcessedForApproval,
                format!("approval requires Processed status, found {:?}", self.status),
            ));
        }
        if cmd.approver_id.trim().is_empty() {
            return Err(DomainError::rejected(
                RejectionCode::ApproverRequired,
                "approver id must not be empty",
            ));
        }
        if cmd.decision == ApprovalDecision::Rejected && cmd.reason.trim().is_empty() {
            return Err(DomainError::rejected(
                RejectionCode::RejectionReasonRequired,
                "a rejection requires a reason",
            ));
        }

        Ok(vec![BillEvent::Approved(BillApproved {
            bill_id: cmd.bill_id.clone(),
            approver_id: cmd.approver_id.clone(),
            decision: cmd.decision,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bill_id() -> BillId {
        BillId::new("b1").unwrap()
    }

    fn file_id() -> FileId {
        FileId::new("f1").unwrap()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn create_cmd() -> BillCommand {
        BillCommand::CreateBill(CreateBill {
            bill_id: bill_id(),
            title: "Electric".to_string(),
            total: dec!(150.00),
            metadata: BTreeMap::new(),
            created_by: "u1".to_string(),
            occurred_at: test_time(),
        })
    }

    fn attach_cmd() -> BillCommand {
        BillCommand::AttachFile(AttachFile {
            bill_id: bill_id(),
            file_id: file_id(),
            filename: "f1.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 1024,
            storage_key: "bills/b1/f1/f1.pdf".to_string(),
            checksum: "abc123".to_string(),
            occurred_at: test_time(),
        })
    }

    fn ocr_cmd() -> BillCommand {
        BillCommand::ApplyOcrResult(ApplyOcrResult {
            bill_id: bill_id(),
            extracted_text: "AMOUNT DUE $150.00".to_string(),
            extracted_total: Some(dec!(150.00)),
            extracted_title: Some("Electric Utility".to_string()),
            confidence: "95%".to_string(),
            processing_time: "1.2s".to_string(),
            occurred_at: test_time(),
        })
    }

    fn approve_cmd(decision: ApprovalDecision, reason: &str) -> BillCommand {
        BillCommand::ApproveBill(ApproveBill {
            bill_id: bill_id(),
            approver_id: "u1".to_string(),
            decision,
            reason: reason.to_string(),
            occurred_at: test_time(),
        })
    }

    fn run(bill: &mut Bill, cmd: &BillCommand) -> Vec<BillEvent> {
        let events = bill.handle(cmd).unwrap();
        for e in &events {
            bill.apply(e);
        }
        events
    }

    fn processed_bill() -> Bill {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());
        run(&mut bill, &attach_cmd());
        run(&mut bill, &ocr_cmd());
        bill
    }

    fn rejection(result: Result<Vec<BillEvent>, DomainError>) -> RejectionCode {
        result.unwrap_err().code()
    }

    #[test]
    fn happy_path_reaches_approved_through_five_events() {
        let mut bill = Bill::empty(bill_id());

        let created = run(&mut bill, &create_cmd());
        assert_eq!(created.len(), 1);
        assert_eq!(bill.status(), BillStatus::Created);

        let attached = run(&mut bill, &attach_cmd());
        assert_eq!(attached.len(), 2);
        assert!(matches!(attached[0], BillEvent::FileAttached(_)));
        assert!(matches!(attached[1], BillEvent::OcrRequested(_)));
        assert_eq!(bill.status(), BillStatus::FileAttached);

        let completed = run(&mut bill, &ocr_cmd());
        assert_eq!(completed.len(), 1);
        assert_eq!(bill.status(), BillStatus::Processed);

        let approved = run(&mut bill, &approve_cmd(ApprovalDecision::Approved, "ok"));
        assert_eq!(approved.len(), 1);
        assert_eq!(bill.status(), BillStatus::Approved);
        assert_eq!(bill.version(), 5);
        assert_eq!(bill.ocr().unwrap().extracted_title.as_deref(), Some("Electric Utility"));
    }

    #[test]
    fn create_requires_title_and_nonnegative_total() {
        let bill = Bill::empty(bill_id());

        let cmd = BillCommand::CreateBill(CreateBill {
            bill_id: bill_id(),
            title: "   ".to_string(),
            total: dec!(1),
            metadata: BTreeMap::new(),
            created_by: "u1".to_string(),
            occurred_at: test_time(),
        });
        assert_eq!(rejection(bill.handle(&cmd)), RejectionCode::TitleRequired);

        let cmd = BillCommand::CreateBill(CreateBill {
            bill_id: bill_id(),
            title: "Electric".to_string(),
            total: dec!(-1),
            metadata: BTreeMap::new(),
            created_by: "u1".to_string(),
            occurred_at: test_time(),
        });
        assert_eq!(rejection(bill.handle(&cmd)), RejectionCode::TotalOutOfRange);
    }

    #[test]
    fn create_twice_is_rejected() {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());
        assert_eq!(rejection(bill.handle(&create_cmd())), RejectionCode::BillAlreadyExists);
    }

    #[test]
    fn attach_validates_name_size_and_duplicates() {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());

        let mut bad_name = attach_cmd();
        if let BillCommand::AttachFile(c) = &mut bad_name {
            c.filename = "".to_string();
        }
        assert_eq!(rejection(bill.handle(&bad_name)), RejectionCode::FileNameRequired);

        let mut bad_size = attach_cmd();
        if let BillCommand::AttachFile(c) = &mut bad_size {
            c.size_bytes = 0;
        }
        assert_eq!(rejection(bill.handle(&bad_size)), RejectionCode::FileSizeInvalid);

        run(&mut bill, &attach_cmd());
        assert_eq!(rejection(bill.handle(&attach_cmd())), RejectionCode::FileAlreadyAttached);
    }

    #[test]
    fn attach_after_processing_skips_ocr_request() {
        let mut bill = processed_bill();

        let mut second = attach_cmd();
        if let BillCommand::AttachFile(c) = &mut second {
            c.file_id = FileId::new("f2").unwrap();
        }
        let events = run(&mut bill, &second);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BillEvent::FileAttached(_)));
        assert_eq!(bill.status(), BillStatus::Processed);
        assert_eq!(bill.files().len(), 2);
    }

    #[test]
    fn approve_before_ocr_is_rejected() {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());
        run(&mut bill, &attach_cmd());

        assert_eq!(
            rejection(bill.handle(&approve_cmd(ApprovalDecision::Approved, "ok"))),
            RejectionCode::StatusNotProcessedForApproval
        );
        assert_eq!(bill.version(), 3);
    }

    #[test]
    fn approve_on_terminal_bill_is_rejected() {
        let mut bill = processed_bill();
        run(&mut bill, &approve_cmd(ApprovalDecision::Approved, "ok"));

        assert_eq!(
            rejection(bill.handle(&approve_cmd(ApprovalDecision::Approved, "again"))),
            RejectionCode::StatusNotProcessedForApproval
        );
    }

    #[test]
    fn rejection_requires_a_reason() {
        let bill = processed_bill();
        assert_eq!(
            rejection(bill.handle(&approve_cmd(ApprovalDecision::Rejected, " "))),
            RejectionCode::RejectionReasonRequired
        );
        assert!(bill.handle(&approve_cmd(ApprovalDecision::Rejected, "illegible scan")).is_ok());
        // Approvals do not need one.
        assert!(bill.handle(&approve_cmd(ApprovalDecision::Approved, "")).is_ok());
    }

    #[test]
    fn ocr_requires_attached_file() {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());
        assert_eq!(rejection(bill.handle(&ocr_cmd())), RejectionCode::NoFileAttachedForOcr);
    }

    #[test]
    fn ocr_replacement_latest_wins() {
        let mut bill = processed_bill();

        let second = BillCommand::ApplyOcrResult(ApplyOcrResult {
            bill_id: bill_id(),
            extracted_text: "corrected".to_string(),
            extracted_total: Some(dec!(151.25)),
            extracted_title: None,
            confidence: "99%".to_string(),
            processing_time: "0.8s".to_string(),
            occurred_at: test_time(),
        });
        run(&mut bill, &second);

        let ocr = bill.ocr().unwrap();
        assert_eq!(ocr.extracted_text, "corrected");
        assert_eq!(ocr.extracted_total, Some(dec!(151.25)));
        assert_eq!(ocr.extracted_title, None);
        assert_eq!(bill.status(), BillStatus::Processed);
    }

    #[test]
    fn ocr_after_approval_is_rejected() {
        let mut bill = processed_bill();
        run(&mut bill, &approve_cmd(ApprovalDecision::Approved, "ok"));
        assert_eq!(rejection(bill.handle(&ocr_cmd())), RejectionCode::BillTerminal);
    }

    #[test]
    fn ocr_normalizes_empty_title_and_rounds_total() {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());
        run(&mut bill, &attach_cmd());

        let cmd = BillCommand::ApplyOcrResult(ApplyOcrResult {
            bill_id: bill_id(),
            extracted_text: "x".to_string(),
            extracted_total: Some(dec!(2.675)),
            extracted_title: Some("  ".to_string()),
            confidence: "50%".to_string(),
            processing_time: "2s".to_string(),
            occurred_at: test_time(),
        });
        let events = run(&mut bill, &cmd);

        match &events[0] {
            BillEvent::OcrCompleted(e) => {
                assert_eq!(e.extracted_title, None);
                assert_eq!(e.extracted_total, Some(dec!(2.68)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn ocr_failure_keeps_status_and_counts() {
        let mut bill = Bill::empty(bill_id());
        run(&mut bill, &create_cmd());
        run(&mut bill, &attach_cmd());

        let fail = BillCommand::MarkOcrFailed(MarkOcrFailed {
            bill_id: bill_id(),
            error_kind: "timeout".to_string(),
            message: "ocr service timed out".to_string(),
            occurred_at: test_time(),
        });
        run(&mut bill, &fail);

        assert_eq!(bill.status(), BillStatus::FileAttached);
        assert_eq!(bill.ocr_failures(), 1);

        // Still retriable: a later OCR result is accepted.
        assert!(bill.handle(&ocr_cmd()).is_ok());
    }

    #[test]
    fn ocr_failure_invalid_outside_file_attached() {
        let bill = processed_bill();
        let fail = BillCommand::MarkOcrFailed(MarkOcrFailed {
            bill_id: bill_id(),
            error_kind: "timeout".to_string(),
            message: "late".to_string(),
            occurred_at: test_time(),
        });
        assert_eq!(
            rejection(bill.handle(&fail)),
            RejectionCode::StatusNotAttachedForOcrFailure
        );
    }

    #[test]
    fn commands_on_missing_bill_are_rejected() {
        let bill = Bill::empty(bill_id());
        assert_eq!(rejection(bill.handle(&attach_cmd())), RejectionCode::BillNotFound);
        assert_eq!(rejection(bill.handle(&ocr_cmd())), RejectionCode::BillNotFound);
        assert_eq!(
            rejection(bill.handle(&approve_cmd(ApprovalDecision::Approved, "ok"))),
            RejectionCode::BillNotFound
        );
    }

    #[test]
    fn replay_is_deterministic() {
        let mut bill = Bill::empty(bill_id());
        let mut stream = Vec::new();
        stream.extend(run(&mut bill, &create_cmd()));
        stream.extend(run(&mut bill, &attach_cmd()));
        stream.extend(run(&mut bill, &ocr_cmd()));
        stream.extend(run(&mut bill, &approve_cmd(ApprovalDecision::Approved, "ok")));

        let once = Bill::replay(bill_id(), &stream);
        let twice = Bill::replay(bill_id(), &stream);
        assert_eq!(once, twice);
        assert_eq!(once, bill);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Handle never mutates state and is deterministic.
            #[test]
            fn handle_is_pure(
                title in "[A-Za-z][A-Za-z0-9 ]{0,40}",
                cents in 0u64..=999_999_999u64,
            ) {
                let total = Decimal::new(cents as i64, 2);
                let cmd = BillCommand::CreateBill(CreateBill {
                    bill_id: bill_id(),
                    title,
                    total,
                    metadata: BTreeMap::new(),
                    created_by: "u1".to_string(),
                    occurred_at: test_time(),
                });

                let bill = Bill::empty(bill_id());
                let before = bill.clone();
                let first = bill.handle(&cmd);
                let second = bill.handle(&cmd);

                prop_assert_eq!(&bill, &before);
                prop_assert_eq!(first.unwrap(), second.unwrap());
            }

            /// Folding the same stream twice yields identical state, and the
            /// status is a pure function of the stream.
            #[test]
            fn fold_is_deterministic(approve in proptest::bool::ANY) {
                let mut bill = Bill::empty(bill_id());
                let mut stream = Vec::new();
                stream.extend(run(&mut bill, &create_cmd()));
                stream.extend(run(&mut bill, &attach_cmd()));
                stream.extend(run(&mut bill, &ocr_cmd()));
                if approve {
                    stream.extend(run(&mut bill, &approve_cmd(ApprovalDecision::Approved, "ok")));
                }

                let replayed = Bill::replay(bill_id(), &stream);
                prop_assert_eq!(&replayed, &bill);
                prop_assert_eq!(replayed.version(), stream.len() as u64);
            }
        }
    }
}
