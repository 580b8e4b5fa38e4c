//! Core traits for the bulk-load engine.
//!
//! - [`Dialect`]: SQL rendering strategy for one destination engine
//! - [`DriverConnection`]: one dedicated connection to the destination
//!
//! The default [`Dialect`] methods render ANSI SQL. Engine dialects override
//! only what their engine does differently (quoting, type names, upsert
//! syntax, missing `IF EXISTS` support), so the statement builders stay in
//! one place.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coercion::SetterKind;
use crate::error::{LoadError, Result};

use super::identifier::{quote_double, LengthSemantics, TableIdentifier};
use super::mode::Mode;
use super::schema::{SqlType, TargetColumn, TargetSchema};
use super::value::BindValue;

/// Shape of the size parameters in a column declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDeclareType {
    /// `TYPE`
    Simple,
    /// `TYPE(size)`
    Size,
    /// `TYPE(size,scale)`, negative scale rendered as 0.
    SizeAndScale,
    /// `TYPE(size,scale)`, or `TYPE(size)` when the scale is negative.
    SizeAndOptionalScale,
}

const STANDARD_SIZE_TYPE_NAMES: &[&str] = &[
    "CHAR",
    "VARCHAR",
    "CHAR VARYING",
    "CHARACTER VARYING",
    "LONGVARCHAR",
    "NCHAR",
    "NVARCHAR",
    "NCHAR VARYING",
    "NATIONAL CHAR VARYING",
    "NATIONAL CHARACTER VARYING",
    "BINARY",
    "VARBINARY",
    "BINARY VARYING",
    "LONGVARBINARY",
    "BIT",
    "VARBIT",
    "BIT VARYING",
    "FLOAT",
];

const STANDARD_SIZE_AND_SCALE_TYPE_NAMES: &[&str] = &["DECIMAL", "NUMERIC"];

/// What a destination engine supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectFeatures {
    /// Longest table name the engine accepts.
    pub max_table_name_length: usize,
    pub length_semantics: LengthSemantics,
    pub supported_modes: Vec<Mode>,
    /// The engine upserts on its own unique keys; `merge_keys` is rejected.
    pub ignore_merge_keys: bool,
}

impl Default for DialectFeatures {
    fn default() -> Self {
        Self {
            max_table_name_length: 64,
            length_semantics: LengthSemantics::Bytes,
            supported_modes: Mode::ALL.to_vec(),
            ignore_merge_keys: false,
        }
    }
}

/// Resolved merge settings for MERGE / MERGE_DIRECT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Columns identifying a row. Empty when the engine uses its own unique keys.
    pub merge_keys: Vec<String>,
    /// Replacement for the generated `SET` list, e.g. `"count" = T."count" + S."count"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_rule: Option<Vec<String>>,
}

/// SQL syntax strategy for one destination engine.
///
/// Every statement builder returns `Result` because identifier quoting
/// rejects malformed names.
pub trait Dialect: Send + Sync {
    /// Dialect name ("standard", "postgres", "mysql", "mssql").
    fn name(&self) -> &str;

    /// Quote an identifier.
    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_double(name)
    }

    /// Quote a possibly schema-qualified table.
    fn quote_table(&self, table: &TableIdentifier) -> Result<String> {
        let mut parts = Vec::with_capacity(3);
        if let Some(database) = &table.database {
            parts.push(self.quote_ident(database)?);
        }
        if let Some(schema) = &table.schema {
            parts.push(self.quote_ident(schema)?);
        }
        parts.push(self.quote_ident(&table.table)?);
        Ok(parts.join("."))
    }

    /// Parameter placeholder for the 1-based `index`.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn features(&self) -> DialectFeatures {
        DialectFeatures::default()
    }

    /// Engine spelling of a generic type name.
    fn convert_type_name(&self, type_name: &str) -> String {
        type_name.to_string()
    }

    fn column_declare_type(&self, converted_type_name: &str, _column: &TargetColumn) -> ColumnDeclareType {
        standard_column_declare_type(converted_type_name)
    }

    /// Type used in CREATE TABLE for `column`.
    fn column_type_sql(&self, column: &TargetColumn) -> String {
        if let Some(declared) = &column.declared_type {
            return declared.clone();
        }
        let name = self.convert_type_name(&column.simple_type_name);
        match self.column_declare_type(&name, column) {
            ColumnDeclareType::Simple => name,
            ColumnDeclareType::Size => format!("{}({})", name, column.size),
            ColumnDeclareType::SizeAndScale => {
                format!("{}({},{})", name, column.size, column.scale.max(0))
            }
            ColumnDeclareType::SizeAndOptionalScale if column.scale < 0 => {
                format!("{}({})", name, column.size)
            }
            ColumnDeclareType::SizeAndOptionalScale => {
                format!("{}({},{})", name, column.size, column.scale)
            }
        }
    }

    /// SQL type of an introspected column type name.
    fn sql_type_of(&self, type_name: &str) -> SqlType {
        standard_sql_type_of(type_name)
    }

    /// Setters that replace the default coercion for specific SQL types.
    fn setter_overrides(&self) -> &'static [(SqlType, SetterKind)] {
        &[]
    }

    /// Whether a failed metadata operation or flush may be retried.
    fn is_retryable(&self, err: &LoadError) -> bool {
        err.is_connection_failure()
    }

    // ===== DDL =====

    fn create_table_sql(
        &self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        constraint: Option<&str>,
        option: Option<&str>,
        if_not_exists: bool,
    ) -> Result<String> {
        let mut columns = Vec::with_capacity(schema.len());
        for c in schema.columns.iter().filter(|c| !c.is_skip()) {
            columns.push(format!("{} {}", self.quote_ident(c.name())?, self.column_type_sql(c)));
        }
        if let Some(constraint) = constraint {
            columns.push(constraint.to_string());
        }

        let mut sql = format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.quote_table(table)?,
            columns.join(", ")
        );
        if let Some(option) = option {
            sql.push(' ');
            sql.push_str(option);
        }
        Ok(sql)
    }

    fn drop_table_sql(&self, table: &TableIdentifier, if_exists: bool) -> Result<String> {
        Ok(format!(
            "DROP TABLE {}{}",
            if if_exists { "IF EXISTS " } else { "" },
            self.quote_table(table)?
        ))
    }

    /// Whether `CREATE TABLE IF NOT EXISTS` and `DROP TABLE IF EXISTS` work.
    /// When they don't, callers check for the table first.
    fn supports_if_exists(&self) -> bool {
        true
    }

    fn rename_table_sql(&self, from: &TableIdentifier, to: &TableIdentifier) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_table(from)?,
            self.quote_ident(&to.table)?
        ))
    }

    fn truncate_sql(&self, table: &TableIdentifier) -> Result<String> {
        Ok(format!("DELETE FROM {}", self.quote_table(table)?))
    }

    /// Statements that replace `to` with `from` inside one transaction.
    fn replace_table_sql(
        &self,
        from: &TableIdentifier,
        to: &TableIdentifier,
        target_exists: bool,
    ) -> Result<Vec<String>> {
        let mut statements = Vec::with_capacity(2);
        if target_exists {
            statements.push(self.drop_table_sql(to, false)?);
        }
        statements.push(self.rename_table_sql(from, to)?);
        Ok(statements)
    }

    // ===== DML =====

    fn quoted_columns(&self, schema: &TargetSchema) -> Result<Vec<String>> {
        schema
            .columns
            .iter()
            .filter(|c| !c.is_skip())
            .map(|c| self.quote_ident(c.name()))
            .collect()
    }

    fn prepared_insert_sql(&self, table: &TableIdentifier, schema: &TargetSchema) -> Result<String> {
        let columns = self.quoted_columns(schema)?;
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_table(table)?,
            columns.join(", "),
            placeholders.join(", ")
        ))
    }

    /// Upsert of one bound row into `table`.
    fn prepared_merge_sql(
        &self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        merge: &MergeConfig,
    ) -> Result<String> {
        let columns = self.quoted_columns(schema)?;
        let source: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} AS {}", self.placeholder(i + 1), c))
            .collect();
        ansi_merge_sql(self, table, &columns, &format!("SELECT {}", source.join(", ")), merge)
    }

    /// `INSERT INTO to SELECT ... FROM a UNION ALL SELECT ... FROM b`.
    fn collect_insert_sql(
        &self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
    ) -> Result<String> {
        let columns = self.quoted_columns(schema)?.join(", ");
        Ok(format!(
            "INSERT INTO {} ({}) {}",
            self.quote_table(to)?,
            columns,
            union_all_sql(self, from, &columns)?
        ))
    }

    /// Merge every row of the `from` tables into `to`.
    fn collect_merge_sql(
        &self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
        merge: &MergeConfig,
    ) -> Result<String> {
        let columns = self.quoted_columns(schema)?;
        let union = union_all_sql(self, from, &columns.join(", "))?;
        ansi_merge_sql(self, to, &columns, &union, merge)
    }
}

/// `SELECT cols FROM a UNION ALL SELECT cols FROM b ...`
pub(crate) fn union_all_sql<D: Dialect + ?Sized>(
    dialect: &D,
    from: &[TableIdentifier],
    columns: &str,
) -> Result<String> {
    let mut selects = Vec::with_capacity(from.len());
    for table in from {
        selects.push(format!("SELECT {} FROM {}", columns, dialect.quote_table(table)?));
    }
    Ok(selects.join(" UNION ALL "))
}

/// `SET` assignments of a merge: the configured rule, or every column from `S`.
pub(crate) fn merge_assignments<D: Dialect + ?Sized>(
    dialect: &D,
    columns: &[String],
    merge: &MergeConfig,
    target_alias: &str,
) -> Result<Vec<String>> {
    if let Some(rule) = &merge.merge_rule {
        return Ok(rule.clone());
    }
    let mut keys = Vec::with_capacity(merge.merge_keys.len());
    for k in &merge.merge_keys {
        keys.push(dialect.quote_ident(k)?);
    }
    Ok(columns
        .iter()
        .filter(|c| !keys.contains(c))
        .map(|c| {
            if target_alias.is_empty() {
                format!("{} = S.{}", c, c)
            } else {
                format!("{}.{} = S.{}", target_alias, c, c)
            }
        })
        .collect())
}

/// `MERGE INTO t AS T USING (source) AS S ON (...) WHEN MATCHED ... WHEN NOT MATCHED ...`
pub(crate) fn ansi_merge_sql<D: Dialect + ?Sized>(
    dialect: &D,
    table: &TableIdentifier,
    columns: &[String],
    source_sql: &str,
    merge: &MergeConfig,
) -> Result<String> {
    if merge.merge_keys.is_empty() {
        return Err(LoadError::Config(format!(
            "{} dialect needs merge keys to merge rows",
            dialect.name()
        )));
    }
    let mut on = Vec::with_capacity(merge.merge_keys.len());
    for k in &merge.merge_keys {
        let k = dialect.quote_ident(k)?;
        on.push(format!("T.{} = S.{}", k, k));
    }

    let mut sql = format!(
        "MERGE INTO {} AS T USING ({}) AS S ON ({})",
        dialect.quote_table(table)?,
        source_sql,
        on.join(" AND ")
    );
    let assignments = merge_assignments(dialect, columns, merge, "")?;
    if !assignments.is_empty() {
        sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", assignments.join(", ")));
    }
    let values: Vec<String> = columns.iter().map(|c| format!("S.{}", c)).collect();
    sql.push_str(&format!(
        " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    ));
    Ok(sql)
}

/// Declaration shape of the standard SQL type names.
pub fn standard_column_declare_type(converted_type_name: &str) -> ColumnDeclareType {
    if STANDARD_SIZE_TYPE_NAMES.contains(&converted_type_name) {
        ColumnDeclareType::Size
    } else if STANDARD_SIZE_AND_SCALE_TYPE_NAMES.contains(&converted_type_name) {
        ColumnDeclareType::SizeAndScale
    } else {
        ColumnDeclareType::Simple
    }
}

/// SQL type of a standard type name as reported by `information_schema`.
pub fn standard_sql_type_of(type_name: &str) -> SqlType {
    match type_name.trim().to_ascii_uppercase().as_str() {
        "BIT" => SqlType::Bit,
        "TINYINT" => SqlType::TinyInt,
        "SMALLINT" | "INT2" => SqlType::SmallInt,
        "INTEGER" | "INT" | "INT4" | "MEDIUMINT" => SqlType::Integer,
        "BIGINT" | "INT8" => SqlType::BigInt,
        "REAL" | "FLOAT4" => SqlType::Real,
        "FLOAT" => SqlType::Float,
        "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" => SqlType::Double,
        "NUMERIC" => SqlType::Numeric,
        "DECIMAL" => SqlType::Decimal,
        "BOOLEAN" | "BOOL" => SqlType::Boolean,
        "CHAR" | "CHARACTER" => SqlType::Char,
        "VARCHAR" | "CHARACTER VARYING" | "CHAR VARYING" => SqlType::VarChar,
        "LONGVARCHAR" | "TEXT" => SqlType::LongVarChar,
        "CLOB" => SqlType::Clob,
        "NCHAR" => SqlType::NChar,
        "NVARCHAR" => SqlType::NVarChar,
        "LONGNVARCHAR" => SqlType::LongNVarChar,
        "NCLOB" => SqlType::NClob,
        "BINARY" => SqlType::Binary,
        "VARBINARY" => SqlType::VarBinary,
        "LONGVARBINARY" => SqlType::LongVarBinary,
        "BLOB" => SqlType::Blob,
        "DATE" => SqlType::Date,
        "TIME" => SqlType::Time,
        "TIMESTAMP" | "DATETIME" => SqlType::Timestamp,
        "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" => SqlType::TimestampTz,
        "JSON" => SqlType::Json,
        _ => SqlType::Other,
    }
}

/// One dedicated connection to the destination.
///
/// Statements run in autocommit unless [`begin`](Self::begin) was called.
/// Connections are never shared between workers.
#[async_trait]
pub trait DriverConnection: Send {
    /// Execute a statement without parameters, returning affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn table_exists(&mut self, table: &TableIdentifier) -> Result<bool>;

    /// Column metadata of an existing table, in ordinal order, with
    /// primary-key columns flagged as unique keys. `None` if it does not exist.
    async fn describe_table(&mut self, table: &TableIdentifier) -> Result<Option<TargetSchema>>;

    /// Execute `sql` once per row of bound parameters inside one transaction.
    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<BindValue>]) -> Result<u64>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ansi;

    impl Dialect for Ansi {
        fn name(&self) -> &str {
            "ansi"
        }
    }

    fn table(name: &str) -> TableIdentifier {
        TableIdentifier::new(None, name)
    }

    fn schema() -> TargetSchema {
        TargetSchema::new(vec![
            TargetColumn::generic("id", SqlType::BigInt, "BIGINT", 22, 0, true, true),
            TargetColumn::skip(),
            TargetColumn::generic("name", SqlType::VarChar, "VARCHAR", 64, 0, false, false),
        ])
    }

    #[test]
    fn test_column_type_sql_shapes() {
        let d = Ansi;
        let varchar = TargetColumn::generic("a", SqlType::VarChar, "VARCHAR", 32, 0, false, false);
        assert_eq!(d.column_type_sql(&varchar), "VARCHAR(32)");

        let numeric = TargetColumn::generic("b", SqlType::Numeric, "NUMERIC", 10, -1, false, false);
        assert_eq!(d.column_type_sql(&numeric), "NUMERIC(10,0)");

        let bigint = TargetColumn::generic("c", SqlType::BigInt, "BIGINT", 22, 0, false, false);
        assert_eq!(d.column_type_sql(&bigint), "BIGINT");

        let declared = TargetColumn::declared("d", "VARCHAR(8) NOT NULL");
        assert_eq!(d.column_type_sql(&declared), "VARCHAR(8) NOT NULL");
    }

    #[test]
    fn test_create_table_sql_with_constraint_and_option() {
        let sql = Ansi
            .create_table_sql(
                &TableIdentifier::new(Some("s".into()), "t"),
                &schema(),
                Some("PRIMARY KEY (\"id\")"),
                Some("WITH (fillfactor = 70)"),
                true,
            )
            .unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"s\".\"t\" (\"id\" BIGINT, \"name\" VARCHAR(64), \
             PRIMARY KEY (\"id\")) WITH (fillfactor = 70)"
        );
    }

    #[test]
    fn test_replace_table_statements() {
        let stmts = Ansi.replace_table_sql(&table("swap"), &table("t"), true).unwrap();
        assert_eq!(
            stmts,
            vec![
                "DROP TABLE \"t\"".to_string(),
                "ALTER TABLE \"swap\" RENAME TO \"t\"".to_string()
            ]
        );
        let stmts = Ansi.replace_table_sql(&table("swap"), &table("t"), false).unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_prepared_insert_skips_skip_columns() {
        let sql = Ansi.prepared_insert_sql(&table("t"), &schema()).unwrap();
        assert_eq!(sql, "INSERT INTO \"t\" (\"id\", \"name\") VALUES (?, ?)");
    }

    #[test]
    fn test_collect_insert_union_all() {
        let sql = Ansi
            .collect_insert_sql(&[table("a"), table("b")], &schema(), &table("t"))
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"t\" (\"id\", \"name\") SELECT \"id\", \"name\" FROM \"a\" \
             UNION ALL SELECT \"id\", \"name\" FROM \"b\""
        );
    }

    #[test]
    fn test_collect_merge_ansi() {
        let merge = MergeConfig {
            merge_keys: vec!["id".into()],
            merge_rule: None,
        };
        let sql = Ansi
            .collect_merge_sql(&[table("a")], &schema(), &table("t"), &merge)
            .unwrap();
        assert_eq!(
            sql,
            "MERGE INTO \"t\" AS T USING (SELECT \"id\", \"name\" FROM \"a\") AS S \
             ON (T.\"id\" = S.\"id\") WHEN MATCHED THEN UPDATE SET \"name\" = S.\"name\" \
             WHEN NOT MATCHED THEN INSERT (\"id\", \"name\") VALUES (S.\"id\", S.\"name\")"
        );
    }

    #[test]
    fn test_merge_rule_replaces_set_list() {
        let merge = MergeConfig {
            merge_keys: vec!["id".into()],
            merge_rule: Some(vec!["\"name\" = 'x'".into()]),
        };
        let sql = Ansi.prepared_merge_sql(&table("t"), &schema(), &merge).unwrap();
        assert!(sql.contains("UPDATE SET \"name\" = 'x' WHEN NOT MATCHED"));
        assert!(sql.starts_with("MERGE INTO \"t\" AS T USING (SELECT ? AS \"id\", ? AS \"name\")"));
    }

    #[test]
    fn test_merge_without_keys_is_rejected() {
        let err = Ansi
            .prepared_merge_sql(&table("t"), &schema(), &MergeConfig::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn test_standard_sql_type_of() {
        assert_eq!(standard_sql_type_of("character varying"), SqlType::VarChar);
        assert_eq!(standard_sql_type_of("BIGINT"), SqlType::BigInt);
        assert_eq!(standard_sql_type_of("geometry"), SqlType::Other);
    }
}
