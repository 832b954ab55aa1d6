//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Machine-readable reason for a rejected command.
///
/// Codes are stable API surface: callers branch on them, so renaming a
/// variant's wire form is a breaking change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    InvalidId,
    IdMismatch,
    BillAlreadyExists,
    BillNotFound,
    TitleRequired,
    TotalOutOfRange,
    FileNameRequired,
    FileSizeInvalid,
    FileAlreadyAttached,
    FileTooLarge,
    ContentTypeNotAllowed,
    BillTerminal,
    NoFileAttachedForOcr,
    StatusNotProcessedForApproval,
    StatusNotAttachedForOcrFailure,
    RejectionReasonRequired,
    ApproverRequired,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::InvalidId => "invalid_id",
            RejectionCode::IdMismatch => "id_mismatch",
            RejectionCode::BillAlreadyExists => "bill_already_exists",
            RejectionCode::BillNotFound => "bill_not_found",
            RejectionCode::TitleRequired => "title_required",
            RejectionCode::TotalOutOfRange => "total_out_of_range",
            RejectionCode::FileNameRequired => "file_name_required",
            RejectionCode::FileSizeInvalid => "file_size_invalid",
            RejectionCode::FileAlreadyAttached => "file_already_attached",
            RejectionCode::FileTooLarge => "file_too_large",
            RejectionCode::ContentTypeNotAllowed => "content_type_not_allowed",
            RejectionCode::BillTerminal => "bill_terminal",
            RejectionCode::NoFileAttachedForOcr => "no_file_attached_for_ocr",
            RejectionCode::StatusNotProcessedForApproval => "status_not_processed_for_approval",
            RejectionCode::StatusNotAttachedForOcrFailure => "status_not_attached_for_ocr_failure",
            RejectionCode::RejectionReasonRequired => "rejection_reason_required",
            RejectionCode::ApproverRequired => "approver_required",
        }
    }
}

impl core::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error.
///
/// Keep this focused on deterministic business failures: a command checked
/// against current state and refused. Infrastructure concerns belong
/// elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A command was rejected against current state.
    #[error("{code}: {message}")]
    Rejected { code: RejectionCode, message: String },
}

impl DomainError {
    pub fn rejected(code: RejectionCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> RejectionCode {
        match self {
            Self::Rejected { code, .. } => *code,
        }
    }
}
