//! Prepared-statement batch insert.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{BatchInsert, RowBuffer};
use crate::core::identifier::TableIdentifier;
use crate::core::schema::TargetSchema;
use crate::core::traits::{Dialect, DriverConnection, MergeConfig};
use crate::core::value::BindValue;
use crate::drivers::Connector;
use crate::error::{LoadError, Result};

/// Binds rows into one prepared INSERT (or upsert, with a merge config) and
/// executes the whole batch in one transaction per flush.
pub struct StandardBatchInsert {
    connector: Arc<dyn Connector>,
    merge: Option<MergeConfig>,
    connection: Option<Box<dyn DriverConnection>>,
    sql: String,
    buffer: RowBuffer,
    total_rows: u64,
}

impl StandardBatchInsert {
    pub fn new(connector: Arc<dyn Connector>, merge: Option<MergeConfig>) -> Self {
        Self {
            connector,
            merge,
            connection: None,
            sql: String::new(),
            buffer: RowBuffer::default(),
            total_rows: 0,
        }
    }

    async fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("Failed to close broken connection: {}", e);
            }
        }
    }
}

#[async_trait]
impl BatchInsert for StandardBatchInsert {
    async fn prepare(&mut self, load_table: &TableIdentifier, insert_schema: &TargetSchema) -> Result<()> {
        let dialect = self.connector.dialect();
        self.sql = match &self.merge {
            Some(merge) => dialect.prepared_merge_sql(load_table, insert_schema, merge)?,
            None => dialect.prepared_insert_sql(load_table, insert_schema)?,
        };
        debug!("Prepared: {}", self.sql);
        self.buffer = RowBuffer::new(insert_schema.insert_schema().len());
        self.total_rows = 0;
        self.connection = Some(self.connector.connect().await?);
        Ok(())
    }

    fn bind(&mut self, value: BindValue) -> Result<()> {
        self.buffer.bind(value)
    }

    fn add(&mut self) -> Result<()> {
        self.buffer.add()
    }

    fn batch_weight(&self) -> u64 {
        self.buffer.weight()
    }

    fn total_rows(&self) -> u64 {
        self.total_rows
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.weight() == 0 {
            return Ok(());
        }
        let rows = self.buffer.rows().len();
        info!("Loading {} rows", rows);
        let start = Instant::now();

        if self.connection.is_none() {
            self.connection = Some(self.connector.connect().await?);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(LoadError::pool("no connection after reconnect", "batch flush"));
        };

        match connection.execute_batch(&self.sql, self.buffer.rows()).await {
            Ok(_) => {
                self.total_rows += rows as u64;
                self.buffer.clear();
                info!(
                    "> {:.2} seconds (loaded {} rows in total)",
                    start.elapsed().as_secs_f64(),
                    self.total_rows
                );
                Ok(())
            }
            Err(e) => {
                // Rows stay buffered for a retry; a broken connection is replaced on the next attempt.
                if e.is_connection_failure() {
                    self.drop_connection().await;
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(mut connection) => connection.close().await,
            None => Ok(()),
        }
    }
}
