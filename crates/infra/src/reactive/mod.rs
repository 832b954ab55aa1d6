//! Reactive handlers: log consumers whose effect is external calls and new
//! commands. Every command they emit goes through the router, so entity
//! invariants hold no matter who writes.

pub mod notification;
pub mod ocr;

/// Drives OCR for attached files.
pub const OCR_ORCHESTRATOR: &str = "ocr-orchestrator";
/// Sends mail on processing and approval.
pub const NOTIFIER: &str = "notifier";

pub use notification::NotificationHandler;
pub use ocr::OcrOrchestrator;
