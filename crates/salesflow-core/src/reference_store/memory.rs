use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use polars::prelude::DataFrame;

use super::{ConnectionDescriptor, StoreError, TableStore};

/// In-process table store that can be told to crash partway through a write.
///
/// Writes land in a staging copy and are swapped in only once every row made it,
/// which is the same contract the Postgres store provides with a transaction.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<String, DataFrame>>,
    fail_after_rows: Mutex<Option<usize>>,
    writes: AtomicUsize,
    released: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the next write once `rows` rows have been staged.
    pub fn fail_next_write_after(&self, rows: usize) {
        *lock(&self.fail_after_rows) = Some(rows);
    }

    pub fn insert(&self, table: &str, frame: DataFrame) {
        lock(&self.tables).insert(table.to_string(), frame);
    }

    pub fn table(&self, table: &str) -> Option<DataFrame> {
        lock(&self.tables).get(table).cloned()
    }

    /// Number of writes that committed.
    pub fn committed_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn replace_table(
        &self,
        _descriptor: &ConnectionDescriptor,
        table: &str,
        rows: &DataFrame,
    ) -> Result<usize, StoreError> {
        if rows.width() == 0 {
            return Err(StoreError::InvalidRows {
                table: table.to_string(),
                reason: "row set has no columns".to_string(),
            });
        }

        let fail_after = lock(&self.fail_after_rows).take();
        let mut staged = rows.clear();
        for offset in 0..rows.height() {
            if fail_after == Some(offset) {
                return Err(StoreError::WriteAborted {
                    table: table.to_string(),
                    rows_written: offset,
                    reason: "simulated crash".to_string(),
                });
            }
            staged.vstack_mut(&rows.slice(offset as i64, 1))?;
        }

        lock(&self.tables).insert(table.to_string(), staged);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(rows.height())
    }

    async fn read_table(
        &self,
        _descriptor: &ConnectionDescriptor,
        table: &str,
    ) -> Result<DataFrame, StoreError> {
        self.table(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
