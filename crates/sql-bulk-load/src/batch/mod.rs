//! Batched row sinks.
//!
//! A [`BatchInsert`] accumulates bound rows for one load table and writes
//! them on [`flush`](BatchInsert::flush). Callers bind exactly one value per
//! insert-schema column and then call [`add`](BatchInsert::add); the buffered
//! weight tells the caller when to flush.

mod standard;

pub use standard::StandardBatchInsert;

use async_trait::async_trait;

use crate::core::identifier::TableIdentifier;
use crate::core::schema::TargetSchema;
use crate::core::value::BindValue;
use crate::error::{LoadError, Result};

/// Fixed weight of one buffered row.
pub const ROW_OVERHEAD: u64 = 32;

/// Fixed weight of one bound column on top of the value's own estimate.
pub const COLUMN_OVERHEAD: u64 = 4;

/// Append-only, weight-tracked sink for rows of one load table.
#[async_trait]
pub trait BatchInsert: Send {
    /// Open the dedicated connection and statement for `load_table`.
    /// Called exactly once, before the first row.
    async fn prepare(&mut self, load_table: &TableIdentifier, insert_schema: &TargetSchema) -> Result<()>;

    /// Bind the next column of the current row.
    fn bind(&mut self, value: BindValue) -> Result<()>;

    /// Commit the bound row into the batch.
    fn add(&mut self) -> Result<()>;

    /// Estimated size of the buffered rows in bytes.
    fn batch_weight(&self) -> u64;

    /// Rows written by completed flushes.
    fn total_rows(&self) -> u64;

    /// Write the buffered rows. A no-op when nothing is buffered. On failure
    /// the rows stay buffered so that the flush can be retried.
    async fn flush(&mut self) -> Result<()>;

    /// Flush the remainder at the end of the worker's input.
    async fn finish(&mut self) -> Result<()> {
        self.flush().await
    }

    /// Release the connection. Idempotent, and safe after any failure.
    async fn close(&mut self) -> Result<()>;
}

/// Row-major buffer shared by the batch implementations.
#[derive(Debug, Default)]
pub(crate) struct RowBuffer {
    column_count: usize,
    current: Vec<BindValue>,
    current_weight: u64,
    rows: Vec<Vec<BindValue>>,
    weight: u64,
}

impl RowBuffer {
    pub(crate) fn new(column_count: usize) -> Self {
        Self {
            column_count,
            current: Vec::with_capacity(column_count),
            ..Default::default()
        }
    }

    pub(crate) fn bind(&mut self, value: BindValue) -> Result<()> {
        if self.current.len() >= self.column_count {
            return Err(LoadError::Config(format!(
                "Row already has all {} columns bound",
                self.column_count
            )));
        }
        self.current_weight += value.weight() + COLUMN_OVERHEAD;
        self.current.push(value);
        Ok(())
    }

    pub(crate) fn add(&mut self) -> Result<()> {
        if self.current.len() != self.column_count {
            return Err(LoadError::Config(format!(
                "Row has {} bound columns, expected {}",
                self.current.len(),
                self.column_count
            )));
        }
        let row = std::mem::replace(&mut self.current, Vec::with_capacity(self.column_count));
        self.rows.push(row);
        self.weight += ROW_OVERHEAD + self.current_weight;
        self.current_weight = 0;
        Ok(())
    }

    pub(crate) fn weight(&self) -> u64 {
        self.weight
    }

    pub(crate) fn rows(&self) -> &[Vec<BindValue>] {
        &self.rows
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
        self.weight = 0;
    }
}
