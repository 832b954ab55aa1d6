//! Explicit wire codec for bill events.
//!
//! One case per kind, in both directions. Adding a kind means adding a case;
//! removing one means deprecating it (keep decoding, stop emitting). A
//! breaking payload change gets a new kind name (e.g. `BillCreatedV2`), never
//! a mutated payload under the old name.

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::bill::{BillEvent, OcrRequested};
use billflow_events::EventRecord;

pub const BILL_CREATED: &str = "BillCreated";
pub const FILE_ATTACHED: &str = "FileAttached";
pub const OCR_REQUESTED: &str = "OcrRequested";
pub const OCR_COMPLETED: &str = "OcrCompleted";
pub const OCR_FAILED: &str = "OcrFailed";
pub const BILL_APPROVED: &str = "BillApproved";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    #[error("payload for {kind} failed to encode: {source}")]
    Encode {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("payload for {kind} failed to decode: {source}")]
    Decode {
        kind: String,
        source: serde_json::Error,
    },
}

fn to_payload<T: Serialize>(kind: &'static str, value: &T) -> Result<JsonValue, CodecError> {
    serde_json::to_value(value).map_err(|source| CodecError::Encode { kind, source })
}

/// Encode a typed event into its wire form: `(kind, payload object)`.
pub fn encode(event: &BillEvent) -> Result<(&'static str, JsonValue), CodecError> {
    match event {
        BillEvent::Created(e) => Ok((BILL_CREATED, to_payload(BILL_CREATED, e)?)),
        BillEvent::FileAttached(e) => Ok((FILE_ATTACHED, to_payload(FILE_ATTACHED, e)?)),
        BillEvent::OcrRequested(e) => Ok((OCR_REQUESTED, to_payload(OCR_REQUESTED, e)?)),
        BillEvent::OcrCompleted(e) => Ok((OCR_COMPLETED, to_payload(OCR_COMPLETED, e)?)),
        BillEvent::OcrFailed(e) => Ok((OCR_FAILED, to_payload(OCR_FAILED, e)?)),
        BillEvent::Approved(e) => Ok((BILL_APPROVED, to_payload(BILL_APPROVED, e)?)),
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: &JsonValue,
) -> Result<T, CodecError> {
    serde_json::from_value(payload.clone()).map_err(|source| CodecError::Decode {
        kind: kind.to_string(),
        source,
    })
}

/// Decode a wire payload back into a typed event.
pub fn decode(kind: &str, payload: &JsonValue) -> Result<BillEvent, CodecError> {
    match kind {
        BILL_CREATED => Ok(BillEvent::Created(from_payload(kind, payload)?)),
        FILE_ATTACHED => Ok(BillEvent::FileAttached(from_payload(kind, payload)?)),
        OCR_REQUESTED => Ok(BillEvent::OcrRequested(from_payload(kind, payload)?)),
        OCR_COMPLETED => Ok(BillEvent::OcrCompleted(from_payload(kind, payload)?)),
        OCR_FAILED => Ok(BillEvent::OcrFailed(from_payload(kind, payload)?)),
        BILL_APPROVED => Ok(BillEvent::Approved(from_payload(kind, payload)?)),
        other => Err(CodecError::UnknownKind(other.to_string())),
    }
}

/// Decode a committed log record.
pub fn decode_record(record: &EventRecord) -> Result<BillEvent, CodecError> {
    decode(&record.kind, &record.payload)
}

/// Decode the one kind the OCR orchestrator dispatches on.
pub fn decode_ocr_requested(record: &EventRecord) -> Result<OcrRequested, CodecError> {
    from_payload(OCR_REQUESTED, &record.payload)
}
