//! Notification delivery.
//!
//! Templating here is deliberately minimal: a template name picks a subject
//! and body shape, variables fill them in. Delivery failures never affect
//! bill state; the notifier consumer retries and dead-letters.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::SmtpTransport;
use lettre::{Message, Transport};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Unavailable(_))
    }
}

/// A rendered-or-renderable notification send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub template: String,
    pub recipients: Vec<String>,
    pub variables: BTreeMap<String, String>,
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

impl<N> Notifier for std::sync::Arc<N>
where
    N: Notifier + ?Sized,
{
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        (**self).send(notification)
    }
}

fn render(template: &str, variables: &BTreeMap<String, String>) -> (String, String) {
    let var = |key: &str| variables.get(key).cloned().unwrap_or_default();
    match template {
        "bill-processed" => (
            format!("Bill {} processed", var("bill_id")),
            format!(
                "OCR finished for bill {}.\nExtracted title: {}\nExtracted total: {}\n",
                var("bill_id"),
                var("extracted_title"),
                var("extracted_total"),
            ),
        ),
        "bill-approved" => (
            format!("Bill {} {}", var("bill_id"), var("decision")),
            format!(
                "Bill {} was {} by {}.\nReason: {}\n",
                var("bill_id"),
                var("decision"),
                var("approver_id"),
                var("reason"),
            ),
        ),
        other => (
            format!("Notification: {other}"),
            variables
                .iter()
                .map(|(k, v)| format!("{k}: {v}\n"))
                .collect(),
        ),
    }
}

/// SMTP delivery via lettre.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(host: &str, port: u16, from: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let from: Mailbox = from
            .parse()
            .map_err(|e| NotifyError::Rejected(format!("invalid from address: {e}")))?;
        let transport = SmtpTransport::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .build();
        Ok(Self { transport, from })
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (subject, body) = render(&notification.template, &notification.variables);

        for recipient in &notification.recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| NotifyError::Rejected(format!("invalid recipient: {e}")))?;
            let message = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(subject.clone())
                .body(body.clone())
                .map_err(|e| NotifyError::Rejected(e.to_string()))?;

            self.transport
                .send(&message)
                .map_err(|e| NotifyError::Unavailable(e.to_string()))?;
        }

        Ok(())
    }
}

/// Records notifications instead of delivering them. Used in tests and in
/// dev mode when no SMTP host is configured.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError::Unavailable("lock poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}
