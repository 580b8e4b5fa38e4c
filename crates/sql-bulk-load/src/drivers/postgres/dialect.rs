//! PostgreSQL SQL dialect (Strategy pattern).
//!
//! Merges are written as a writable CTE: update the matching rows, then
//! insert the source rows the update did not return. This works on every
//! PostgreSQL version with `RETURNING` in CTEs and needs no unique index on
//! the merge keys.

use crate::coercion::SetterKind;
use crate::core::identifier::{LengthSemantics, TableIdentifier};
use crate::core::mode::Mode;
use crate::core::schema::{SqlType, TargetColumn, TargetSchema};
use crate::core::traits::{
    merge_assignments, standard_column_declare_type, standard_sql_type_of, union_all_sql,
    ColumnDeclareType, Dialect, DialectFeatures, MergeConfig,
};
use crate::error::{LoadError, Result};

/// SQLSTATEs worth retrying: serialization failure, deadlock, lock not available.
const RETRYABLE_SQL_STATES: &[&str] = &["40001", "40P01", "55P03"];

/// NUMERIC precision above which the declaration is left unconstrained.
const MAX_NUMERIC_PRECISION: i32 = 1000;

const SETTER_OVERRIDES: &[(SqlType, SetterKind)] = &[(SqlType::Json, SetterKind::Json)];

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    /// `UPDATE ... FROM S RETURNING` followed by the insert of unmatched rows.
    fn merge_tail(
        &self,
        table: &TableIdentifier,
        columns: &[String],
        merge: &MergeConfig,
    ) -> Result<String> {
        if merge.merge_keys.is_empty() {
            return Err(LoadError::Config(
                "postgres dialect needs merge keys to merge rows".into(),
            ));
        }
        let target = self.quote_table(table)?;
        let mut keys = Vec::with_capacity(merge.merge_keys.len());
        for k in &merge.merge_keys {
            keys.push(self.quote_ident(k)?);
        }

        let mut assignments = merge_assignments(self, columns, merge, "")?;
        if assignments.is_empty() {
            // every column is a key; a no-op update still reports the match
            assignments = keys.iter().map(|k| format!("{} = S.{}", k, k)).collect();
        }
        let join: Vec<String> = keys.iter().map(|k| format!("{}.{} = S.{}", target, k, k)).collect();
        let returning: Vec<String> = keys.iter().map(|k| format!("S.{}", k)).collect();
        let matched: Vec<String> = keys.iter().map(|k| format!("S.{} = updated.{}", k, k)).collect();

        Ok(format!(
            "updated AS (UPDATE {} SET {} FROM S WHERE {} RETURNING {}) \
             INSERT INTO {} ({}) SELECT {} FROM S WHERE NOT EXISTS (SELECT 1 FROM updated WHERE {})",
            target,
            assignments.join(", "),
            join.join(" AND "),
            returning.join(", "),
            target,
            columns.join(", "),
            columns.join(", "),
            matched.join(" AND ")
        ))
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn features(&self) -> DialectFeatures {
        DialectFeatures {
            max_table_name_length: 63,
            length_semantics: LengthSemantics::Bytes,
            supported_modes: vec![
                Mode::Insert,
                Mode::InsertDirect,
                Mode::Merge,
                Mode::MergeDirect,
                Mode::TruncateInsert,
                Mode::Replace,
            ],
            ignore_merge_keys: false,
        }
    }

    fn convert_type_name(&self, type_name: &str) -> String {
        match type_name {
            "CLOB" => "TEXT".to_string(),
            "BLOB" => "BYTEA".to_string(),
            other => other.to_string(),
        }
    }

    fn column_declare_type(&self, converted_type_name: &str, column: &TargetColumn) -> ColumnDeclareType {
        match converted_type_name {
            "VARCHAR" | "CHARACTER VARYING" if column.size == i32::MAX => ColumnDeclareType::Simple,
            "NUMERIC" | "DECIMAL" if column.size > MAX_NUMERIC_PRECISION => ColumnDeclareType::Simple,
            other => standard_column_declare_type(other),
        }
    }

    fn sql_type_of(&self, type_name: &str) -> SqlType {
        match type_name.trim().to_ascii_lowercase().as_str() {
            "text" | "citext" => SqlType::LongVarChar,
            "bytea" => SqlType::VarBinary,
            "json" | "jsonb" => SqlType::Json,
            "timestamp without time zone" => SqlType::Timestamp,
            "timestamp with time zone" => SqlType::TimestampTz,
            "time without time zone" | "time with time zone" => SqlType::Time,
            "uuid" => SqlType::Other,
            _ => standard_sql_type_of(type_name),
        }
    }

    fn setter_overrides(&self) -> &'static [(SqlType, SetterKind)] {
        SETTER_OVERRIDES
    }

    fn is_retryable(&self, err: &LoadError) -> bool {
        err.is_connection_failure()
            || err
                .sql_state()
                .is_some_and(|s| RETRYABLE_SQL_STATES.contains(&s.as_str()))
    }

    fn prepared_merge_sql(
        &self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        merge: &MergeConfig,
    ) -> Result<String> {
        let columns = self.quoted_columns(schema)?;
        let casts: Vec<String> = schema
            .columns
            .iter()
            .filter(|c| !c.is_skip())
            .zip(&columns)
            .enumerate()
            .map(|(i, (c, quoted))| {
                format!("CAST({} AS {}) AS {}", self.placeholder(i + 1), self.column_type_sql(c), quoted)
            })
            .collect();
        Ok(format!(
            "WITH S AS (SELECT {}), {}",
            casts.join(", "),
            self.merge_tail(table, &columns, merge)?
        ))
    }

    fn collect_merge_sql(
        &self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
        merge: &MergeConfig,
    ) -> Result<String> {
        let columns = self.quoted_columns(schema)?;
        let mut keys = Vec::with_capacity(merge.merge_keys.len());
        for k in &merge.merge_keys {
            keys.push(self.quote_ident(k)?);
        }
        let union = union_all_sql(self, from, &columns.join(", "))?;
        Ok(format!(
            "WITH S AS (SELECT DISTINCT ON ({}) * FROM ({}) AS U), {}",
            keys.join(", "),
            union,
            self.merge_tail(to, &columns, merge)?
        ))
    }
}
