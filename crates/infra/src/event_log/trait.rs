use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use billflow_billing::{BillEvent, codec};
use billflow_core::BillId;
use billflow_events::{Event, EventRecord, Subscription};

/// An event ready to be appended (not yet assigned sequence/position).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub kind: &'static str,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Build from a typed bill event through the explicit codec.
    pub fn from_event(event: &BillEvent) -> Result<Self, EventLogError> {
        let (kind, payload) = codec::encode(event)
            .map_err(|e| EventLogError::InvalidAppend(format!("encode failed: {e}")))?;
        Ok(Self {
            kind,
            payload,
            occurred_at: event.occurred_at(),
        })
    }
}

#[derive(Debug, Error)]
pub enum EventLogError {
    /// The supplied expected sequence was stale; nothing was written. The
    /// caller reloads and retries.
    #[error("concurrency conflict on {bill_id}: expected next sequence {expected}, found {found}")]
    ConcurrencyConflict {
        bill_id: BillId,
        expected: u64,
        found: u64,
    },

    /// Transient storage failure; safe to retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Malformed append (empty batch, encode failure). Programming error,
    /// not caller-visible as such.
    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

impl EventLogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EventLogError::StorageUnavailable(_))
    }
}

/// Append-only, per-entity-ordered durable event log.
///
/// - `append` is the serialization point per entity: it fails with
///   [`EventLogError::ConcurrencyConflict`] unless `expected_next_sequence`
///   equals the entity's next unused sequence, and writes nothing on failure.
/// - Subscribers must not observe an event before its append returns; reads
///   at any point are restartable and the full history is retained forever.
pub trait EventLog: Send + Sync {
    /// Append events to one entity's stream. On success every event has been
    /// durably persisted and assigned its sequence and global position.
    fn append(
        &self,
        bill_id: &BillId,
        expected_next_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    /// Read one entity's events with `sequence >= from_sequence`, in
    /// sequence order.
    fn read_entity(
        &self,
        bill_id: &BillId,
        from_sequence: u64,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    /// Read up to `limit` events with `position > position`, in position
    /// order, across all entities. This is the pull form of the global
    /// subscription; consumers resume from their tracking token.
    fn read_since(&self, position: u64, limit: usize) -> Result<Vec<EventRecord>, EventLogError>;

    /// Highest assigned global position (0 when the log is empty).
    fn current_position(&self) -> Result<u64, EventLogError>;

    /// Wakeup stream of committed positions. Latency hint only — it may drop
    /// or duplicate; consumers always re-read from `read_since`.
    fn subscribe_wakeups(&self) -> Subscription<u64>;
}

impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    fn append(
        &self,
        bill_id: &BillId,
        expected_next_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        (**self).append(bill_id, expected_next_sequence, events)
    }

    fn read_entity(
        &self,
        bill_id: &BillId,
        from_sequence: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        (**self).read_entity(bill_id, from_sequence)
    }

    fn read_since(&self, position: u64, limit: usize) -> Result<Vec<EventRecord>, EventLogError> {
        (**self).read_since(position, limit)
    }

    fn current_position(&self) -> Result<u64, EventLogError> {
        (**self).current_position()
    }

    fn subscribe_wakeups(&self) -> Subscription<u64> {
        (**self).subscribe_wakeups()
    }
}
