use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use billflow_core::{BillId, FileId};

use super::{
    BillFileRow, BillSummaryRow, DeadLetterRow, ReadModelError, ReadModelStore, RowChange,
};
use crate::projections::{BILL_FILES, BILL_SUMMARY};

#[derive(Debug, Default)]
struct Tables {
    summaries: HashMap<BillId, BillSummaryRow>,
    files: HashMap<(BillId, FileId), BillFileRow>,
    tokens: HashMap<String, u64>,
    dead_letters: Vec<DeadLetterRow>,
}

/// In-memory read-model store for tests/dev.
///
/// A single RwLock makes `apply` trivially atomic: row changes and the token
/// advance happen under one write guard.
#[derive(Debug, Default)]
pub struct InMemoryReadModelStore {
    tables: RwLock<Tables>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, ReadModelError> {
        self.tables
            .read()
            .map_err(|_| ReadModelError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, ReadModelError> {
        self.tables
            .write()
            .map_err(|_| ReadModelError::Unavailable("lock poisoned".to_string()))
    }
}

impl ReadModelStore for InMemoryReadModelStore {
    fn tracking_position(&self, consumer: &str) -> Result<u64, ReadModelError> {
        Ok(*self.read()?.tokens.get(consumer).unwrap_or(&0))
    }

    fn apply(
        &self,
        consumer: &str,
        position: u64,
        changes: &[RowChange],
    ) -> Result<(), ReadModelError> {
        let mut tables = self.write()?;

        let token = *tables.tokens.get(consumer).unwrap_or(&0);
        if position <= token {
            // Already committed (replay or duplicate delivery).
            return Ok(());
        }

        for change in changes {
            match change {
                RowChange::UpsertSummary(row) => {
                    tables.summaries.insert(row.bill_id.clone(), row.clone());
                }
                RowChange::UpsertFile(row) => {
                    tables
                        .files
                        .insert((row.bill_id.clone(), row.file_id.clone()), row.clone());
                }
                RowChange::DeadLetter(row) => {
                    tables.dead_letters.push(row.clone());
                }
            }
        }

        tables.tokens.insert(consumer.to_string(), position);
        Ok(())
    }

    fn reset(&self, consumer: &str) -> Result<(), ReadModelError> {
        let mut tables = self.write()?;
        match consumer {
            BILL_SUMMARY => tables.summaries.clear(),
            BILL_FILES => tables.files.clear(),
            _ => {}
        }
        tables.tokens.insert(consumer.to_string(), 0);
        Ok(())
    }

    fn summary(&self, bill_id: &BillId) -> Result<Option<BillSummaryRow>, ReadModelError> {
        Ok(self.read()?.summaries.get(bill_id).cloned())
    }

    fn summaries(&self) -> Result<Vec<BillSummaryRow>, ReadModelError> {
        Ok(self.read()?.summaries.values().cloned().collect())
    }

    fn files_for(&self, bill_id: &BillId) -> Result<Vec<BillFileRow>, ReadModelError> {
        let tables = self.read()?;
        let mut files: Vec<BillFileRow> = tables
            .files
            .iter()
            .filter(|((bid, _), _)| bid == bill_id)
            .map(|(_, row)| row.clone())
            .collect();
        files.sort_by(|a, b| {
            a.attached_at
                .cmp(&b.attached_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(files)
    }

    fn file(
        &self,
        bill_id: &BillId,
        file_id: &FileId,
    ) -> Result<Option<BillFileRow>, ReadModelError> {
        Ok(self
            .read()?
            .files
            .get(&(bill_id.clone(), file_id.clone()))
            .cloned())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterRow>, ReadModelError> {
        Ok(self.read()?.dead_letters.clone())
    }

    fn tracking_positions(&self) -> Result<BTreeMap<String, u64>, ReadModelError> {
        Ok(self
            .read()?
            .tokens
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}
