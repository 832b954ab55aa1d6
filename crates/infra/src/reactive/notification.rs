//! Notification consumer: mail on `OcrCompleted` and `BillApproved`.

use std::collections::BTreeMap;

use tracing::debug;

use billflow_billing::{ApprovalDecision, BillEvent, codec};
use billflow_events::EventRecord;

use crate::adapters::{Notification, Notifier};
use crate::consumer::{HandlerError, LogHandler};
use crate::read_model::RowChange;

use super::NOTIFIER;

/// Sends templated notifications for processing and approval outcomes.
/// Retries ride on the consumer's poison budget; a dead-lettered
/// notification never affects bill state.
pub struct NotificationHandler<N> {
    notifier: N,
    recipients: Vec<String>,
}

impl<N> NotificationHandler<N>
where
    N: Notifier,
{
    pub fn new(notifier: N, recipients: Vec<String>) -> Self {
        Self {
            notifier,
            recipients,
        }
    }

    fn send(&self, template: &str, variables: BTreeMap<String, String>) -> Result<(), HandlerError> {
        if self.recipients.is_empty() {
            debug!(template, "no notification recipients configured, skipping");
            return Ok(());
        }

        let notification = Notification {
            template: template.to_string(),
            recipients: self.recipients.clone(),
            variables,
        };

        self.notifier.send(&notification).map_err(|e| {
            if e.is_transient() {
                HandlerError::Transient(e.to_string())
            } else {
                HandlerError::Permanent(e.to_string())
            }
        })
    }
}

impl<N> LogHandler for NotificationHandler<N>
where
    N: Notifier + Send,
{
    fn consumer_name(&self) -> &'static str {
        NOTIFIER
    }

    fn handle(&mut self, record: &EventRecord) -> Result<Vec<RowChange>, HandlerError> {
        let event = match record.kind.as_str() {
            codec::OCR_COMPLETED | codec::BILL_APPROVED => codec::decode_record(record)
                .map_err(|e| HandlerError::Permanent(e.to_string()))?,
            _ => return Ok(vec![]),
        };

        match event {
            BillEvent::OcrCompleted(e) => {
                let variables = BTreeMap::from([
                    ("bill_id".to_string(), e.bill_id.to_string()),
                    (
                        "extracted_title".to_string(),
                        e.extracted_title.unwrap_or_default(),
                    ),
                    (
                        "extracted_total".to_string(),
                        e.extracted_total.map(|t| t.to_string()).unwrap_or_default(),
                    ),
                    ("confidence".to_string(), e.confidence),
                ]);
                self.send("bill-processed", variables)?;
            }
            BillEvent::Approved(e) => {
                let decision = match e.decision {
                    ApprovalDecision::Approved => "approved",
                    ApprovalDecision::Rejected => "rejected",
                };
                let variables = BTreeMap::from([
                    ("bill_id".to_string(), e.bill_id.to_string()),
                    ("decision".to_string(), decision.to_string()),
                    ("approver_id".to_string(), e.approver_id),
                    ("reason".to_string(), e.reason),
                ]);
                self.send("bill-approved", variables)?;
            }
            _ => {}
        }

        Ok(vec![])
    }
}
