//! Database driver implementations.
//!
//! - [`postgres`]: PostgreSQL (deadpool-postgres, optional COPY batch insert)
//! - [`mysql`]: MySQL / MariaDB (mysql_async)
//! - [`mssql`]: Microsoft SQL Server (tiberius over bb8)
//! - [`common`]: TLS settings shared by the drivers
//!
//! # Architecture
//!
//! Each driver module provides:
//! - a `Dialect`: SQL rendering for the engine
//! - a [`Connector`]: hands out dedicated [`DriverConnection`]s from a pool
//!
//! [`DialectImpl`] dispatches statically over the dialects. The
//! [`StandardDialect`] renders plain ANSI SQL and is used for engines without
//! a dedicated driver (and by the in-memory engine in the integration tests).

pub mod common;
pub mod mssql;
pub mod mysql;
pub mod postgres;

pub use common::SslMode;
pub use mssql::{MssqlConnector, MssqlDialect};
pub use mysql::{MysqlConnector, MysqlDialect};
pub use postgres::{PostgresConnector, PostgresDialect};

use std::sync::Arc;

use async_trait::async_trait;

use crate::batch::BatchInsert;
use crate::coercion::SetterKind;
use crate::config::{ConnectionConfig, DriverKind};
use crate::core::identifier::TableIdentifier;
use crate::core::schema::{SqlType, TargetColumn, TargetSchema};
use crate::core::traits::{ColumnDeclareType, Dialect, DialectFeatures, DriverConnection, MergeConfig};
use crate::error::{LoadError, Result};

/// ANSI SQL with double-quoted identifiers and `MERGE` upserts.
#[derive(Debug, Clone, Default)]
pub struct StandardDialect;

impl Dialect for StandardDialect {
    fn name(&self) -> &str {
        "standard"
    }
}

/// Enum-based static dispatch for dialects.
///
/// The compiler generates a match per call instead of a vtable lookup.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Standard(StandardDialect),
    Postgres(PostgresDialect),
    Mysql(MysqlDialect),
    Mssql(MssqlDialect),
}

impl DialectImpl {
    pub fn for_driver(driver: DriverKind) -> Self {
        match driver {
            DriverKind::Postgres => DialectImpl::Postgres(PostgresDialect::new()),
            DriverKind::Mysql => DialectImpl::Mysql(MysqlDialect::new()),
            DriverKind::Mssql => DialectImpl::Mssql(MssqlDialect::new()),
        }
    }

    /// Dialect by name, falling back to the standard dialect for unknown engines.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => DialectImpl::Postgres(PostgresDialect::new()),
            "mysql" | "mariadb" => DialectImpl::Mysql(MysqlDialect::new()),
            "mssql" | "sqlserver" | "sql_server" => DialectImpl::Mssql(MssqlDialect::new()),
            _ => DialectImpl::Standard(StandardDialect),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $call:expr) => {
        match $self {
            DialectImpl::Standard($d) => $call,
            DialectImpl::Postgres($d) => $call,
            DialectImpl::Mysql($d) => $call,
            DialectImpl::Mssql($d) => $call,
        }
    };
}

impl Dialect for DialectImpl {
    fn name(&self) -> &str {
        dispatch!(self, d => d.name())
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        dispatch!(self, d => d.quote_ident(name))
    }

    fn quote_table(&self, table: &TableIdentifier) -> Result<String> {
        dispatch!(self, d => d.quote_table(table))
    }

    fn placeholder(&self, index: usize) -> String {
        dispatch!(self, d => d.placeholder(index))
    }

    fn features(&self) -> DialectFeatures {
        dispatch!(self, d => d.features())
    }

    fn convert_type_name(&self, type_name: &str) -> String {
        dispatch!(self, d => d.convert_type_name(type_name))
    }

    fn column_declare_type(&self, converted_type_name: &str, column: &TargetColumn) -> ColumnDeclareType {
        dispatch!(self, d => d.column_declare_type(converted_type_name, column))
    }

    fn column_type_sql(&self, column: &TargetColumn) -> String {
        dispatch!(self, d => d.column_type_sql(column))
    }

    fn sql_type_of(&self, type_name: &str) -> SqlType {
        dispatch!(self, d => d.sql_type_of(type_name))
    }

    fn setter_overrides(&self) -> &'static [(SqlType, SetterKind)] {
        dispatch!(self, d => d.setter_overrides())
    }

    fn is_retryable(&self, err: &LoadError) -> bool {
        dispatch!(self, d => d.is_retryable(err))
    }

    fn create_table_sql(
        &self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        constraint: Option<&str>,
        option: Option<&str>,
        if_not_exists: bool,
    ) -> Result<String> {
        dispatch!(self, d => d.create_table_sql(table, schema, constraint, option, if_not_exists))
    }

    fn drop_table_sql(&self, table: &TableIdentifier, if_exists: bool) -> Result<String> {
        dispatch!(self, d => d.drop_table_sql(table, if_exists))
    }

    fn supports_if_exists(&self) -> bool {
        dispatch!(self, d => d.supports_if_exists())
    }

    fn rename_table_sql(&self, from: &TableIdentifier, to: &TableIdentifier) -> Result<String> {
        dispatch!(self, d => d.rename_table_sql(from, to))
    }

    fn truncate_sql(&self, table: &TableIdentifier) -> Result<String> {
        dispatch!(self, d => d.truncate_sql(table))
    }

    fn replace_table_sql(
        &self,
        from: &TableIdentifier,
        to: &TableIdentifier,
        target_exists: bool,
    ) -> Result<Vec<String>> {
        dispatch!(self, d => d.replace_table_sql(from, to, target_exists))
    }

    fn quoted_columns(&self, schema: &TargetSchema) -> Result<Vec<String>> {
        dispatch!(self, d => d.quoted_columns(schema))
    }

    fn prepared_insert_sql(&self, table: &TableIdentifier, schema: &TargetSchema) -> Result<String> {
        dispatch!(self, d => d.prepared_insert_sql(table, schema))
    }

    fn prepared_merge_sql(
        &self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        merge: &MergeConfig,
    ) -> Result<String> {
        dispatch!(self, d => d.prepared_merge_sql(table, schema, merge))
    }

    fn collect_insert_sql(
        &self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
    ) -> Result<String> {
        dispatch!(self, d => d.collect_insert_sql(from, schema, to))
    }

    fn collect_merge_sql(
        &self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
        merge: &MergeConfig,
    ) -> Result<String> {
        dispatch!(self, d => d.collect_merge_sql(from, schema, to, merge))
    }
}

/// Source of dedicated destination connections.
///
/// The metadata connection and every worker's batch insert each get their
/// own connection; connections are never shared.
#[async_trait]
pub trait Connector: Send + Sync {
    fn dialect(&self) -> &DialectImpl;

    /// Open (or check out) a dedicated connection.
    async fn connect(&self) -> Result<Box<dyn DriverConnection>>;

    /// Alternate batch insert for `insert_method: copy`, if the driver has one.
    fn copy_batch_insert(&self) -> Option<Box<dyn BatchInsert>> {
        None
    }
}

/// Build the connector for `config`, sized for `max_connections` concurrent connections.
pub async fn connector_for(config: &ConnectionConfig, max_connections: usize) -> Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match config.driver {
        DriverKind::Postgres => Arc::new(PostgresConnector::new(config, max_connections).await?),
        DriverKind::Mysql => Arc::new(MysqlConnector::new(config, max_connections).await?),
        DriverKind::Mssql => Arc::new(MssqlConnector::new(config, max_connections).await?),
    };
    Ok(connector)
}
