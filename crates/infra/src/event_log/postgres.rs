//! Postgres-backed event log.
//!
//! Events live in a single append-only `bill_events` table. The global
//! position comes from a BIGSERIAL primary key; appends serialize on a
//! transaction-scoped advisory lock so positions become visible in commit
//! order and `read_since` never observes a gap that later fills in.
//!
//! ## Error mapping
//!
//! | Failure | `EventLogError` |
//! |---|---|
//! | Unique violation on `(bill_id, sequence)` (code 23505) | `ConcurrencyConflict` |
//! | Stale expected sequence detected up front | `ConcurrencyConflict` |
//! | Pool/network/other database errors | `StorageUnavailable` |
//! | Corrupt stored row | `InvalidAppend` |

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use billflow_core::BillId;
use billflow_events::{EventBus, EventRecord, InMemoryEventBus, Subscription};

use super::r#trait::{EventLog, EventLogError, NewEvent};

const APPEND_LOCK_KEY: i64 = 0x62696c_6c666c; // "billfl"

#[derive(Debug, FromRow)]
struct EventRow {
    position: i64,
    bill_id: String,
    sequence: i64,
    kind: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = EventLogError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let entity_id = BillId::new(row.bill_id)
            .map_err(|e| EventLogError::InvalidAppend(format!("corrupt bill_id in row: {e}")))?;
        Ok(EventRecord {
            kind: row.kind,
            entity_id,
            sequence: row.sequence as u64,
            position: row.position as u64,
            timestamp: row.occurred_at,
            payload: row.payload,
        })
    }
}

/// Postgres event log. `Clone` shares the pool.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: Arc<PgPool>,
    runtime: Handle,
    wakeups: Arc<InMemoryEventBus<u64>>,
}

impl PostgresEventLog {
    /// `runtime` is the tokio runtime the pool belongs to; the sync trait
    /// methods block on it, so they must be called from plain (or blocking)
    /// threads, never from inside that runtime's async context.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            wakeups: Arc::new(InMemoryEventBus::new()),
        }
    }

    /// Create the `bill_events` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bill_events (
                position    BIGSERIAL PRIMARY KEY,
                bill_id     TEXT NOT NULL,
                sequence    BIGINT NOT NULL CHECK (sequence >= 0),
                kind        TEXT NOT NULL,
                payload     JSONB NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                UNIQUE (bill_id, sequence)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    #[instrument(skip(self, events), fields(bill_id = %bill_id, event_count = events.len()), err)]
    pub async fn append_events(
        &self,
        bill_id: &BillId,
        expected_next_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::InvalidAppend("empty batch".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        let next_sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence) + 1, 0) FROM bill_events WHERE bill_id = $1",
        )
        .bind(bill_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_error)?;

        if expected_next_sequence != next_sequence as u64 {
            return Err(EventLogError::ConcurrencyConflict {
                bill_id: bill_id.clone(),
                expected: expected_next_sequence,
                found: next_sequence as u64,
            });
        }

        let mut last_timestamp: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT occurred_at FROM bill_events WHERE bill_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(bill_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?;

        let mut committed = Vec::with_capacity(events.len());
        let mut sequence = next_sequence;

        for event in events {
            let mut timestamp = event.occurred_at;
            if let Some(last) = last_timestamp {
                if timestamp <= last {
                    timestamp = last + Duration::microseconds(1);
                }
            }
            last_timestamp = Some(timestamp);

            let row = sqlx::query(
                r#"
                INSERT INTO bill_events (bill_id, sequence, kind, payload, occurred_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING position
                "#,
            )
            .bind(bill_id.as_str())
            .bind(sequence)
            .bind(event.kind)
            .bind(&event.payload)
            .bind(timestamp)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventLogError::ConcurrencyConflict {
                        bill_id: bill_id.clone(),
                        expected: expected_next_sequence,
                        found: sequence as u64,
                    }
                } else {
                    storage_error(e)
                }
            })?;

            let position: i64 = row.try_get("position").map_err(storage_error)?;
            committed.push(EventRecord {
                kind: event.kind.to_string(),
                entity_id: bill_id.clone(),
                sequence: sequence as u64,
                position: position as u64,
                timestamp,
                payload: event.payload,
            });
            sequence += 1;
        }

        tx.commit().await.map_err(storage_error)?;

        if let Some(last) = committed.last() {
            let _ = self.wakeups.publish(last.position);
        }

        Ok(committed)
    }

    pub async fn load_entity(
        &self,
        bill_id: &BillId,
        from_sequence: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT position, bill_id, sequence, kind, payload, occurred_at
            FROM bill_events
            WHERE bill_id = $1 AND sequence >= $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(bill_id.as_str())
        .bind(from_sequence as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    pub async fn load_since(
        &self,
        position: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT position, bill_id, sequence, kind, payload, occurred_at
            FROM bill_events
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            "#,
        )
        .bind(position as i64)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    pub async fn max_position(&self) -> Result<u64, EventLogError> {
        let position: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM bill_events")
                .fetch_one(&*self.pool)
                .await
                .map_err(storage_error)?;
        Ok(position as u64)
    }
}

impl EventLog for PostgresEventLog {
    fn append(
        &self,
        bill_id: &BillId,
        expected_next_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        self.runtime
            .block_on(self.append_events(bill_id, expected_next_sequence, events))
    }

    fn read_entity(
        &self,
        bill_id: &BillId,
        from_sequence: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        self.runtime
            .block_on(self.load_entity(bill_id, from_sequence))
    }

    fn read_since(&self, position: u64, limit: usize) -> Result<Vec<EventRecord>, EventLogError> {
        self.runtime.block_on(self.load_since(position, limit))
    }

    fn current_position(&self) -> Result<u64, EventLogError> {
        self.runtime.block_on(self.max_position())
    }

    fn subscribe_wakeups(&self) -> Subscription<u64> {
        self.wakeups.subscribe()
    }
}

fn storage_error(e: sqlx::Error) -> EventLogError {
    EventLogError::StorageUnavailable(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
