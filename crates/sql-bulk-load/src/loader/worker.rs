//! One worker's page output: coerces records and feeds its batch insert.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::batch::BatchInsert;
use crate::coercion::ColumnSetter;
use crate::core::identifier::TableIdentifier;
use crate::core::traits::Dialect;
use crate::core::value::Record;
use crate::drivers::DialectImpl;
use crate::error::{LoadError, Result};
use crate::retry::{LoggingHooks, RetryExecutor};

/// Rows written by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_index: usize,
    pub rows: u64,
}

/// Sequential writer for one partition of the input.
///
/// Records are converted column by column and added to the batch. A single
/// [`add`](Self::add) flushes first whenever the weight exceeds `batch_size`.
/// [`add_page`](Self::add_page) lets a page overrun the limit up to twice
/// `batch_size` and flushes at the end of the page once it is over the limit,
/// so a flush carries whole pages where it can.
pub struct LoadWorker {
    worker_index: usize,
    load_table: TableIdentifier,
    // Locked only while a retried flush borrows it.
    batch: Mutex<Box<dyn BatchInsert>>,
    setters: Vec<ColumnSetter>,
    batch_size: u64,
    dialect: DialectImpl,
    /// `None` in direct modes: a failed flush there fails the worker at once.
    retry: Option<RetryExecutor>,
}

impl LoadWorker {
    pub(crate) fn new(
        worker_index: usize,
        load_table: TableIdentifier,
        batch: Box<dyn BatchInsert>,
        setters: Vec<ColumnSetter>,
        batch_size: u64,
        dialect: DialectImpl,
        retry: Option<RetryExecutor>,
    ) -> Self {
        Self {
            worker_index,
            load_table,
            batch: Mutex::new(batch),
            setters,
            batch_size,
            dialect,
            retry,
        }
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn load_table(&self) -> &TableIdentifier {
        &self.load_table
    }

    /// Buffered weight not yet flushed.
    pub fn batch_weight(&mut self) -> u64 {
        self.batch.get_mut().batch_weight()
    }

    /// Add every record of `page`.
    pub async fn add_page(&mut self, page: &[Record]) -> Result<()> {
        let force_flush_size = self.batch_size.saturating_mul(2);
        for record in page {
            self.add_over(record, force_flush_size).await?;
        }
        if self.batch.get_mut().batch_weight() > self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Add one record, flushing first when the batch is over its limit.
    pub async fn add(&mut self, record: &Record) -> Result<()> {
        self.add_over(record, self.batch_size).await
    }

    async fn add_over(&mut self, record: &Record, flush_size: u64) -> Result<()> {
        if self.batch.get_mut().batch_weight() > flush_size {
            self.flush().await?;
        }
        if record.len() != self.setters.len() {
            return Err(LoadError::load(
                self.load_table.to_string(),
                format!(
                    "Record has {} values but the input schema has {} columns",
                    record.len(),
                    self.setters.len()
                ),
            ));
        }
        let batch = self.batch.get_mut();
        for (setter, value) in self.setters.iter().zip(record) {
            if let Some(bind) = setter.bind(value) {
                batch.bind(bind)?;
            }
        }
        batch.add()
    }

    /// Write the buffered rows, retrying transient failures outside direct modes.
    pub async fn flush(&mut self) -> Result<()> {
        self.write(false).await
    }

    /// Flush the remainder and release the connection. The worker is consumed
    /// either way; a close failure after an earlier failure is attached to it.
    pub async fn finish(mut self) -> Result<WorkerReport> {
        let result = self.write(true).await;
        let batch = self.batch.get_mut();
        let closed = batch.close().await;
        match (result, closed) {
            (Ok(()), Ok(())) => {
                let report = WorkerReport {
                    worker_index: self.worker_index,
                    rows: batch.total_rows(),
                };
                info!(
                    "Worker {} loaded {} rows into {}",
                    self.worker_index, report.rows, self.load_table
                );
                Ok(report)
            }
            (Ok(()), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close)) => Err(e.with_suppressed(&close)),
        }
    }

    /// Release the connection without flushing.
    pub async fn abort(mut self) {
        debug!("Aborting worker {}", self.worker_index);
        if let Err(e) = self.batch.get_mut().close().await {
            warn!("Failed to close worker {}: {}", self.worker_index, e);
        }
    }

    async fn write(&mut self, finish: bool) -> Result<()> {
        let Some(retry) = self.retry.clone() else {
            let batch = self.batch.get_mut();
            return if finish {
                batch.finish().await
            } else {
                batch.flush().await
            };
        };

        let description = format!("Flush into {}", self.load_table);
        let dialect = self.dialect.clone();
        let hooks = LoggingHooks::new(&description, |e: &LoadError| dialect.is_retryable(e));
        let batch = &self.batch;
        retry
            .run(&hooks, || async {
                let mut batch = batch.lock().await;
                if finish {
                    batch.finish().await
                } else {
                    batch.flush().await
                }
            })
            .await
    }
}
