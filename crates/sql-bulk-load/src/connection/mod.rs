//! Metadata connection: table DDL, introspection, and the commit statements.
//!
//! [`OutputConnection`] renders SQL through the dialect and runs it on one
//! driver connection, logging every statement with its elapsed time. The
//! multi-statement operations (collect, replace) run inside one transaction
//! and roll back on failure.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::identifier::TableIdentifier;
use crate::core::schema::TargetSchema;
use crate::core::traits::{Dialect, DriverConnection, MergeConfig};
use crate::drivers::DialectImpl;
use crate::error::{LoadError, Result};

/// Options appended to generated CREATE TABLE statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateTableOptions<'a> {
    pub constraint: Option<&'a str>,
    pub option: Option<&'a str>,
}

/// One destination connection used for metadata and commit operations.
pub struct OutputConnection {
    dialect: DialectImpl,
    connection: Box<dyn DriverConnection>,
}

impl OutputConnection {
    pub fn new(dialect: DialectImpl, connection: Box<dyn DriverConnection>) -> Self {
        Self {
            dialect,
            connection,
        }
    }

    pub fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    /// Run one statement, returning affected rows.
    pub async fn execute_update(&mut self, sql: &str) -> Result<u64> {
        info!("SQL: {}", sql);
        let start = Instant::now();
        let count = self.connection.execute(sql).await?;
        info!(
            "> {:.2} seconds ({} rows)",
            start.elapsed().as_secs_f64(),
            count
        );
        Ok(count)
    }

    pub async fn table_exists(&mut self, table: &TableIdentifier) -> Result<bool> {
        self.connection.table_exists(table).await
    }

    /// Introspect an existing table.
    pub async fn describe_table(&mut self, table: &TableIdentifier) -> Result<Option<TargetSchema>> {
        let schema = self.connection.describe_table(table).await?;
        if let Some(schema) = &schema {
            debug!("Table {} has {} columns", table, schema.len());
        }
        Ok(schema)
    }

    pub async fn create_table(
        &mut self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        options: CreateTableOptions<'_>,
    ) -> Result<()> {
        let sql = self
            .dialect
            .create_table_sql(table, schema, options.constraint, options.option, false)?;
        self.execute_update(&sql).await?;
        Ok(())
    }

    pub async fn create_table_if_not_exists(
        &mut self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        options: CreateTableOptions<'_>,
    ) -> Result<()> {
        if !self.dialect.supports_if_exists() {
            if self.table_exists(table).await? {
                return Ok(());
            }
            return self.create_table(table, schema, options).await;
        }
        let sql = self
            .dialect
            .create_table_sql(table, schema, options.constraint, options.option, true)?;
        self.execute_update(&sql).await?;
        Ok(())
    }

    pub async fn drop_table(&mut self, table: &TableIdentifier) -> Result<()> {
        let sql = self.dialect.drop_table_sql(table, false)?;
        self.execute_update(&sql).await?;
        Ok(())
    }

    /// Drop `table` when it exists. Dropping a missing table is a no-op.
    pub async fn drop_table_if_exists(&mut self, table: &TableIdentifier) -> Result<()> {
        if !self.dialect.supports_if_exists() {
            if self.table_exists(table).await? {
                self.drop_table(table).await?;
            }
            return Ok(());
        }
        let sql = self.dialect.drop_table_sql(table, true)?;
        self.execute_update(&sql).await?;
        Ok(())
    }

    /// Run `statements` as one transaction.
    pub async fn execute_in_transaction(&mut self, statements: &[String]) -> Result<()> {
        self.connection.begin().await?;
        for sql in statements {
            if let Err(e) = self.execute_update(sql).await {
                return Err(self.rollback_after(e).await);
            }
        }
        if let Err(e) = self.connection.commit().await {
            return Err(self.rollback_after(e).await);
        }
        Ok(())
    }

    async fn rollback_after(&mut self, err: LoadError) -> LoadError {
        match self.connection.rollback().await {
            Ok(()) => err,
            Err(rollback_err) => {
                warn!("Rollback failed: {}", rollback_err);
                err.with_suppressed(&rollback_err)
            }
        }
    }

    /// Copy every row of the `from` tables into `to`, optionally deleting the
    /// existing rows of `to` first.
    pub async fn collect_insert(
        &mut self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
        truncate_destination: bool,
        pre_sql: Option<&str>,
        post_sql: Option<&str>,
    ) -> Result<()> {
        let mut statements = Vec::new();
        if truncate_destination {
            statements.push(self.dialect.truncate_sql(to)?);
        }
        statements.extend(pre_sql.map(str::to_string));
        if !from.is_empty() {
            statements.push(self.dialect.collect_insert_sql(from, schema, to)?);
        }
        statements.extend(post_sql.map(str::to_string));
        self.execute_in_transaction(&statements).await
    }

    /// Merge every row of the `from` tables into `to`.
    pub async fn collect_merge(
        &mut self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
        merge: &MergeConfig,
        pre_sql: Option<&str>,
        post_sql: Option<&str>,
    ) -> Result<()> {
        let mut statements = Vec::new();
        statements.extend(pre_sql.map(str::to_string));
        if !from.is_empty() {
            statements.push(self.dialect.collect_merge_sql(from, schema, to, merge)?);
        }
        statements.extend(post_sql.map(str::to_string));
        self.execute_in_transaction(&statements).await
    }

    /// Replace `to` with `from`: drop `to` if it exists and rename `from`,
    /// in one transaction.
    pub async fn replace_table(
        &mut self,
        from: &TableIdentifier,
        to: &TableIdentifier,
        post_sql: Option<&str>,
    ) -> Result<()> {
        let target_exists = self.table_exists(to).await?;
        let mut statements = self.dialect.replace_table_sql(from, to, target_exists)?;
        statements.extend(post_sql.map(str::to_string));
        self.execute_in_transaction(&statements).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.connection.close().await
    }
}
