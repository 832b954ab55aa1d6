//! Thin typed clients for external collaborators: blob store, OCR service,
//! SMTP. The core only sees the traits; implementations carry the deadlines
//! and transports.

pub mod blob;
pub mod ocr_http;
pub mod smtp;

pub use blob::{BlobError, BlobStore, InMemoryBlobStore};
pub use ocr_http::{HttpOcrService, OcrError, OcrExtraction, OcrService};
pub use smtp::{Notification, Notifier, NotifyError, RecordingNotifier, SmtpNotifier};
