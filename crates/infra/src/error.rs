//! Caller-visible error taxonomy for the command and query surfaces.

use thiserror::Error;

use billflow_core::{DomainError, RejectionCode};

/// Errors surfaced by the router and query service. The HTTP boundary maps
/// these to status codes; reactive handlers never surface them to a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Command invalid against current state. Safe to report verbatim.
    #[error("business rule violation ({code}): {message}")]
    BusinessRuleViolation { code: RejectionCode, message: String },

    /// Queried entity or file unknown to the read model: either not yet
    /// projected or it does not exist.
    #[error("not found")]
    NotFound,

    /// Still contending after router retries. Idempotent caller retry is
    /// safe.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Caller-initiated cancellation observed before any effect.
    #[error("cancelled before append")]
    Cancelled,

    /// Downstream storage or external service failed after retries. Safe to
    /// retry the command.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// Unexpected invariant violation. Not retriable without operator
    /// action.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    /// Stable machine-readable tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::BusinessRuleViolation { .. } => "business_rule_violation",
            ServiceError::NotFound => "not_found",
            ServiceError::ConcurrencyConflict(_) => "concurrency_conflict",
            ServiceError::Cancelled => "cancelled",
            ServiceError::TransientFailure(_) => "transient_failure",
            ServiceError::InternalError(_) => "internal_error",
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Rejected { code, message } => {
                ServiceError::BusinessRuleViolation { code, message }
            }
        }
    }
}
