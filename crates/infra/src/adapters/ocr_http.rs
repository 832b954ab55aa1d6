//! OCR service client.
//!
//! The service is an RPC with a fixed schema: bytes in, extraction out. The
//! blocking reqwest client fits the synchronous handler threads; the deadline
//! comes from `ocr.timeout`.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrExtraction {
    pub text: String,
    pub total: Option<Decimal>,
    pub title: Option<String>,
    pub confidence: String,
    pub processing_time: String,
}

#[derive(Debug, Error)]
pub enum OcrError {
    /// Timeout, connection failure, 5xx: retry may help.
    #[error("ocr transient failure: {0}")]
    Transient(String),

    /// The service understood the request and refused it (unsupported
    /// format, undecodable image). Retrying the same bytes cannot help.
    #[error("ocr rejected input ({kind}): {message}")]
    Rejected { kind: String, message: String },
}

impl OcrError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OcrError::Transient(_))
    }
}

pub trait OcrService: Send + Sync {
    fn extract(
        &self,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
    ) -> Result<OcrExtraction, OcrError>;
}

impl<O> OcrService for std::sync::Arc<O>
where
    O: OcrService + ?Sized,
{
    fn extract(
        &self,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
    ) -> Result<OcrExtraction, OcrError> {
        (**self).extract(bytes, content_type, filename)
    }
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    text: String,
    #[serde(default)]
    total: Option<Decimal>,
    #[serde(default)]
    title: Option<String>,
    confidence: String,
    processing_time: String,
}

#[derive(Debug, Deserialize)]
struct ExtractErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// HTTP client for the OCR microservice.
pub struct HttpOcrService {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpOcrService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, OcrError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OcrError::Transient(format!("client construction failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl OcrService for HttpOcrService {
    fn extract(
        &self,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
    ) -> Result<OcrExtraction, OcrError> {
        let url = format!("{}/extract", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-filename", filename)
            .body(bytes.to_vec())
            .send()
            .map_err(|e| OcrError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: ExtractResponse = response
                .json()
                .map_err(|e| OcrError::Transient(format!("undecodable response: {e}")))?;
            return Ok(OcrExtraction {
                text: body.text,
                total: body.total,
                title: body.title,
                confidence: body.confidence,
                processing_time: body.processing_time,
            });
        }

        if status.is_client_error() {
            let body: ExtractErrorResponse = response.json().unwrap_or(ExtractErrorResponse {
                error: status.to_string(),
                message: String::new(),
            });
            return Err(OcrError::Rejected {
                kind: if body.error.is_empty() {
                    status.to_string()
                } else {
                    body.error
                },
                message: body.message,
            });
        }

        Err(OcrError::Transient(format!("ocr service returned {status}")))
    }
}
