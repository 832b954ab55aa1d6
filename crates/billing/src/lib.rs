//! Billing domain module (event-sourced).
//!
//! This crate contains the business rules for bills, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage). The [`Bill`]
//! aggregate decides events from commands and folds events into state; the
//! [`codec`] module is the only serialization path for its events.

pub mod bill;
pub mod codec;

pub use bill::{
    ApplyOcrResult, ApprovalDecision, ApprovalRecord, ApproveBill, AttachFile, Bill, BillApproved,
    BillCommand, BillCreated, BillEvent, BillStatus, CreateBill, FileAttached, FileRecord,
    MarkOcrFailed, OcrCompleted, OcrFailed, OcrRequested, OcrResult,
};
pub use codec::{CodecError, decode, encode};
