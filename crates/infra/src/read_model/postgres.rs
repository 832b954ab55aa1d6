//! Postgres-backed read-model store.
//!
//! `apply` runs row changes and the token advance in one transaction, which
//! is what makes crash/restart safe: either the whole step committed or none
//! of it did. The token row is locked `FOR UPDATE` so the stale-position
//! check and the advance are race-free.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use tokio::runtime::Handle;

use billflow_billing::{ApprovalDecision, BillStatus};
use billflow_core::{BillId, FileId};

use super::{
    BillFileRow, BillSummaryRow, DeadLetterRow, ReadModelError, ReadModelStore, RowChange,
};
use crate::projections::{BILL_FILES, BILL_SUMMARY};

#[derive(Clone)]
pub struct PostgresReadModelStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

fn status_to_str(status: BillStatus) -> &'static str {
    match status {
        BillStatus::Created => "created",
        BillStatus::FileAttached => "file_attached",
        BillStatus::Processed => "processed",
        BillStatus::Approved => "approved",
        BillStatus::Rejected => "rejected",
    }
}

fn status_from_str(raw: &str) -> Result<BillStatus, ReadModelError> {
    match raw {
        "created" => Ok(BillStatus::Created),
        "file_attached" => Ok(BillStatus::FileAttached),
        "processed" => Ok(BillStatus::Processed),
        "approved" => Ok(BillStatus::Approved),
        "rejected" => Ok(BillStatus::Rejected),
        other => Err(ReadModelError::Corrupt(format!("unknown status {other:?}"))),
    }
}

fn decision_to_str(decision: ApprovalDecision) -> &'static str {
    match decision {
        ApprovalDecision::Approved => "approved",
        ApprovalDecision::Rejected => "rejected",
    }
}

fn decision_from_str(raw: &str) -> Result<ApprovalDecision, ReadModelError> {
    match raw {
        "approved" => Ok(ApprovalDecision::Approved),
        "rejected" => Ok(ApprovalDecision::Rejected),
        other => Err(ReadModelError::Corrupt(format!("unknown decision {other:?}"))),
    }
}

fn unavailable(e: sqlx::Error) -> ReadModelError {
    ReadModelError::Unavailable(e.to_string())
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    bill_id: String,
    title: String,
    total: Decimal,
    created_by: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    file_count: i32,
    ocr_text: Option<String>,
    ocr_total: Option<Decimal>,
    ocr_title: Option<String>,
    ocr_confidence: Option<String>,
    approver_id: Option<String>,
    decision: Option<String>,
    approval_reason: Option<String>,
    decided_at: Option<DateTime<Utc>>,
    last_sequence: i64,
}

impl TryFrom<SummaryRow> for BillSummaryRow {
    type Error = ReadModelError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        Ok(BillSummaryRow {
            bill_id: BillId::new(row.bill_id).map_err(|e| ReadModelError::Corrupt(e.to_string()))?,
            title: row.title,
            total: row.total,
            created_by: row.created_by,
            status: status_from_str(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            file_count: row.file_count as u32,
            ocr_text: row.ocr_text,
            ocr_total: row.ocr_total,
            ocr_title: row.ocr_title,
            ocr_confidence: row.ocr_confidence,
            approver_id: row.approver_id,
            decision: row.decision.as_deref().map(decision_from_str).transpose()?,
            approval_reason: row.approval_reason,
            decided_at: row.decided_at,
            last_sequence: row.last_sequence as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    bill_id: String,
    file_id: String,
    filename: String,
    content_type: String,
    size_bytes: i64,
    storage_key: String,
    checksum: String,
    attached_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for BillFileRow {
    type Error = ReadModelError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(BillFileRow {
            bill_id: BillId::new(row.bill_id).map_err(|e| ReadModelError::Corrupt(e.to_string()))?,
            file_id: FileId::new(row.file_id).map_err(|e| ReadModelError::Corrupt(e.to_string()))?,
            filename: row.filename,
            content_type: row.content_type,
            size_bytes: row.size_bytes as u64,
            storage_key: row.storage_key,
            checksum: row.checksum,
            attached_at: row.attached_at,
        })
    }
}

impl PostgresReadModelStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ReadModelError> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS bill_summary (
                bill_id         TEXT PRIMARY KEY,
                title           TEXT NOT NULL,
                total           NUMERIC(12,2) NOT NULL,
                created_by      TEXT NOT NULL,
                status          TEXT NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL,
                file_count      INTEGER NOT NULL,
                ocr_text        TEXT,
                ocr_total       NUMERIC(12,2),
                ocr_title       TEXT,
                ocr_confidence  TEXT,
                approver_id     TEXT,
                decision        TEXT,
                approval_reason TEXT,
                decided_at      TIMESTAMPTZ,
                last_sequence   BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bill_files (
                bill_id      TEXT NOT NULL,
                file_id      TEXT NOT NULL,
                filename     TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes   BIGINT NOT NULL,
                storage_key  TEXT NOT NULL,
                checksum     TEXT NOT NULL,
                attached_at  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (bill_id, file_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS consumer_tokens (
                consumer      TEXT PRIMARY KEY,
                last_position BIGINT NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id          BIGSERIAL PRIMARY KEY,
                consumer    TEXT NOT NULL,
                position    BIGINT NOT NULL,
                kind        TEXT NOT NULL,
                bill_id     TEXT NOT NULL,
                error       TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    async fn apply_tx(
        &self,
        consumer: &str,
        position: u64,
        changes: &[RowChange],
    ) -> Result<(), ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT last_position FROM consumer_tokens WHERE consumer = $1 FOR UPDATE",
        )
        .bind(consumer)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        if current.unwrap_or(0) as u64 >= position {
            return Ok(());
        }

        for change in changes {
            apply_change(&mut tx, change).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO consumer_tokens (consumer, last_position)
            VALUES ($1, $2)
            ON CONFLICT (consumer)
            DO UPDATE SET last_position = EXCLUDED.last_position, updated_at = NOW()
            "#,
        )
        .bind(consumer)
        .bind(position as i64)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)
    }

    async fn reset_tx(&self, consumer: &str) -> Result<(), ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        match consumer {
            BILL_SUMMARY => {
                sqlx::query("TRUNCATE bill_summary")
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable)?;
            }
            BILL_FILES => {
                sqlx::query("TRUNCATE bill_files")
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable)?;
            }
            _ => {}
        }

        sqlx::query(
            r#"
            INSERT INTO consumer_tokens (consumer, last_position)
            VALUES ($1, 0)
            ON CONFLICT (consumer)
            DO UPDATE SET last_position = 0, updated_at = NOW()
            "#,
        )
        .bind(consumer)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)
    }
}

async fn apply_change(
    tx: &mut Transaction<'_, Postgres>,
    change: &RowChange,
) -> Result<(), ReadModelError> {
    match change {
        RowChange::UpsertSummary(row) => {
            sqlx::query(
                r#"
                INSERT INTO bill_summary (
                    bill_id, title, total, created_by, status, created_at,
                    updated_at, file_count, ocr_text, ocr_total, ocr_title,
                    ocr_confidence, approver_id, decision, approval_reason,
                    decided_at, last_sequence
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT (bill_id) DO UPDATE SET
                    title = EXCLUDED.title,
                    total = EXCLUDED.total,
                    created_by = EXCLUDED.created_by,
                    status = EXCLUDED.status,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    file_count = EXCLUDED.file_count,
                    ocr_text = EXCLUDED.ocr_text,
                    ocr_total = EXCLUDED.ocr_total,
                    ocr_title = EXCLUDED.ocr_title,
                    ocr_confidence = EXCLUDED.ocr_confidence,
                    approver_id = EXCLUDED.approver_id,
                    decision = EXCLUDED.decision,
                    approval_reason = EXCLUDED.approval_reason,
                    decided_at = EXCLUDED.decided_at,
                    last_sequence = EXCLUDED.last_sequence
                "#,
            )
            .bind(row.bill_id.as_str())
            .bind(&row.title)
            .bind(row.total)
            .bind(&row.created_by)
            .bind(status_to_str(row.status))
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.file_count as i32)
            .bind(&row.ocr_text)
            .bind(row.ocr_total)
            .bind(&row.ocr_title)
            .bind(&row.ocr_confidence)
            .bind(&row.approver_id)
            .bind(row.decision.map(decision_to_str))
            .bind(&row.approval_reason)
            .bind(row.decided_at)
            .bind(row.last_sequence as i64)
            .execute(&mut **tx)
            .await
            .map_err(unavailable)?;
        }
        RowChange::UpsertFile(row) => {
            sqlx::query(
                r#"
                INSERT INTO bill_files (
                    bill_id, file_id, filename, content_type, size_bytes,
                    storage_key, checksum, attached_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (bill_id, file_id) DO UPDATE SET
                    filename = EXCLUDED.filename,
                    content_type = EXCLUDED.content_type,
                    size_bytes = EXCLUDED.size_bytes,
                    storage_key = EXCLUDED.storage_key,
                    checksum = EXCLUDED.checksum,
                    attached_at = EXCLUDED.attached_at
                "#,
            )
            .bind(row.bill_id.as_str())
            .bind(row.file_id.as_str())
            .bind(&row.filename)
            .bind(&row.content_type)
            .bind(row.size_bytes as i64)
            .bind(&row.storage_key)
            .bind(&row.checksum)
            .bind(row.attached_at)
            .execute(&mut **tx)
            .await
            .map_err(unavailable)?;
        }
        RowChange::DeadLetter(row) => {
            sqlx::query(
                r#"
                INSERT INTO dead_letters (consumer, position, kind, bill_id, error, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&row.consumer)
            .bind(row.position as i64)
            .bind(&row.kind)
            .bind(row.bill_id.as_str())
            .bind(&row.error)
            .bind(row.recorded_at)
            .execute(&mut **tx)
            .await
            .map_err(unavailable)?;
        }
    }
    Ok(())
}

impl ReadModelStore for PostgresReadModelStore {
    fn tracking_position(&self, consumer: &str) -> Result<u64, ReadModelError> {
        self.runtime.block_on(async {
            let current: Option<i64> = sqlx::query_scalar(
                "SELECT last_position FROM consumer_tokens WHERE consumer = $1",
            )
            .bind(consumer)
            .fetch_optional(&*self.pool)
            .await
            .map_err(unavailable)?;
            Ok(current.unwrap_or(0) as u64)
        })
    }

    fn apply(
        &self,
        consumer: &str,
        position: u64,
        changes: &[RowChange],
    ) -> Result<(), ReadModelError> {
        self.runtime.block_on(self.apply_tx(consumer, position, changes))
    }

    fn reset(&self, consumer: &str) -> Result<(), ReadModelError> {
        self.runtime.block_on(self.reset_tx(consumer))
    }

    fn summary(&self, bill_id: &BillId) -> Result<Option<BillSummaryRow>, ReadModelError> {
        self.runtime.block_on(async {
            let row: Option<SummaryRow> =
                sqlx::query_as("SELECT * FROM bill_summary WHERE bill_id = $1")
                    .bind(bill_id.as_str())
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(unavailable)?;
            row.map(BillSummaryRow::try_from).transpose()
        })
    }

    fn summaries(&self) -> Result<Vec<BillSummaryRow>, ReadModelError> {
        self.runtime.block_on(async {
            let rows: Vec<SummaryRow> = sqlx::query_as("SELECT * FROM bill_summary")
                .fetch_all(&*self.pool)
                .await
                .map_err(unavailable)?;
            rows.into_iter().map(BillSummaryRow::try_from).collect()
        })
    }

    fn files_for(&self, bill_id: &BillId) -> Result<Vec<BillFileRow>, ReadModelError> {
        self.runtime.block_on(async {
            let rows: Vec<FileRow> = sqlx::query_as(
                "SELECT * FROM bill_files WHERE bill_id = $1 ORDER BY attached_at, file_id",
            )
            .bind(bill_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(unavailable)?;
            rows.into_iter().map(BillFileRow::try_from).collect()
        })
    }

    fn file(
        &self,
        bill_id: &BillId,
        file_id: &FileId,
    ) -> Result<Option<BillFileRow>, ReadModelError> {
        self.runtime.block_on(async {
            let row: Option<FileRow> =
                sqlx::query_as("SELECT * FROM bill_files WHERE bill_id = $1 AND file_id = $2")
                    .bind(bill_id.as_str())
                    .bind(file_id.as_str())
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(unavailable)?;
            row.map(BillFileRow::try_from).transpose()
        })
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterRow>, ReadModelError> {
        self.runtime.block_on(async {
            let rows: Vec<(String, i64, String, String, String, DateTime<Utc>)> = sqlx::query_as(
                "SELECT consumer, position, kind, bill_id, error, recorded_at FROM dead_letters ORDER BY id",
            )
            .fetch_all(&*self.pool)
            .await
            .map_err(unavailable)?;

            rows.into_iter()
                .map(|(consumer, position, kind, bill_id, error, recorded_at)| {
                    Ok(DeadLetterRow {
                        consumer,
                        position: position as u64,
                        kind,
                        bill_id: BillId::new(bill_id)
                            .map_err(|e| ReadModelError::Corrupt(e.to_string()))?,
                        error,
                        recorded_at,
                    })
                })
                .collect()
        })
    }

    fn tracking_positions(&self) -> Result<BTreeMap<String, u64>, ReadModelError> {
        self.runtime.block_on(async {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT consumer, last_position FROM consumer_tokens")
                    .fetch_all(&*self.pool)
                    .await
                    .map_err(unavailable)?;
            Ok(rows.into_iter().map(|(k, v)| (k, v as u64)).collect())
        })
    }
}
