//! MSSQL SQL dialect (Strategy pattern).
//!
//! Provides MSSQL-specific SQL syntax for identifier quoting, type names,
//! parameter placeholders and table swaps.

use crate::coercion::SetterKind;
use crate::core::identifier::{quote_bracket, LengthSemantics, TableIdentifier};
use crate::core::mode::Mode;
use crate::core::schema::{SqlType, TargetSchema};
use crate::core::traits::{
    ansi_merge_sql, standard_sql_type_of, union_all_sql, Dialect, DialectFeatures, MergeConfig,
};
use crate::error::{LoadError, Result};

/// Deadlock victim; lock request time out period exceeded.
const RETRYABLE_ERROR_CODES: &[i64] = &[1205, 1222];

// TINYINT is unsigned on SQL Server.
const SETTER_OVERRIDES: &[(SqlType, SetterKind)] = &[(SqlType::TinyInt, SetterKind::UnsignedByte)];

/// Microsoft SQL Server dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new MSSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &str {
        "mssql"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_bracket(name)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn features(&self) -> DialectFeatures {
        DialectFeatures {
            max_table_name_length: 128,
            length_semantics: LengthSemantics::Characters,
            supported_modes: vec![
                Mode::Insert,
                Mode::InsertDirect,
                Mode::Merge,
                Mode::TruncateInsert,
                Mode::Replace,
            ],
            ignore_merge_keys: false,
        }
    }

    fn convert_type_name(&self, type_name: &str) -> String {
        match type_name {
            "CLOB" => "NVARCHAR(MAX)".to_string(),
            "BLOB" => "VARBINARY(MAX)".to_string(),
            "BOOLEAN" => "BIT".to_string(),
            // TIMESTAMP is a row version on SQL Server.
            "TIMESTAMP" => "DATETIME2".to_string(),
            other => other.to_string(),
        }
    }

    fn sql_type_of(&self, type_name: &str) -> SqlType {
        match type_name.trim().to_ascii_lowercase().as_str() {
            "datetime" | "datetime2" | "smalldatetime" => SqlType::Timestamp,
            "datetimeoffset" => SqlType::TimestampTz,
            "ntext" => SqlType::LongNVarChar,
            "image" => SqlType::LongVarBinary,
            "money" | "smallmoney" => SqlType::Decimal,
            "uniqueidentifier" | "xml" => SqlType::Other,
            _ => standard_sql_type_of(type_name),
        }
    }

    fn setter_overrides(&self) -> &'static [(SqlType, SetterKind)] {
        SETTER_OVERRIDES
    }

    fn is_retryable(&self, err: &LoadError) -> bool {
        err.is_connection_failure()
            || err
                .error_code()
                .is_some_and(|code| RETRYABLE_ERROR_CODES.contains(&code))
    }

    fn supports_if_exists(&self) -> bool {
        false
    }

    fn rename_table_sql(&self, from: &TableIdentifier, to: &TableIdentifier) -> Result<String> {
        // sp_rename takes the new name unquoted; only the old name is qualified.
        let from = self.quote_table(from)?;
        quote_bracket(&to.table)?;
        Ok(format!(
            "EXEC sp_rename N'{}', N'{}'",
            from.replace('\'', "''"),
            to.table.replace('\'', "''")
        ))
    }

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
        let sql = ansi_merge_sql(self, table, &columns, &format!("SELECT {}", source.join(", ")), merge)?;
        Ok(format!("{};", sql))
    }

    fn collect_merge_sql(
        &self,
        from: &[TableIdentifier],
        schema: &TargetSchema,
        to: &TableIdentifier,
        merge: &MergeConfig,
    ) -> Result<String> {
        let columns = self.quoted_columns(schema)?;
        let union = union_all_sql(self, from, &columns.join(", "))?;
        // MERGE requires the statement terminator.
        Ok(format!("{};", ansi_merge_sql(self, to, &columns, &union, merge)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::TargetColumn;

    fn table(name: &str) -> TableIdentifier {
        TableIdentifier::new(Some("dbo".into()), name)
    }

    fn schema() -> TargetSchema {
        TargetSchema::new(vec![
            TargetColumn::generic("id", SqlType::BigInt, "BIGINT", 22, 0, true, true),
            TargetColumn::generic("name", SqlType::Clob, "CLOB", 4000, 0, false, false),
        ])
    }

    fn merge() -> MergeConfig {
        MergeConfig {
            merge_keys: vec!["id".into()],
            merge_rule: None,
        }
    }

    #[test]
    fn test_quote_ident() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.quote_ident("users").unwrap(), "[users]");
        assert_eq!(dialect.quote_ident("my]table").unwrap(), "[my]]table]");
    }

    #[test]
    fn test_column_types() {
        let d = MssqlDialect::new();
        assert_eq!(d.column_type_sql(&schema().columns[1]), "NVARCHAR(MAX)");
        let ts = TargetColumn::for_input("at", crate::core::schema::InputType::Timestamp);
        assert_eq!(d.column_type_sql(&ts), "DATETIME2");
        let flag = TargetColumn::for_input("ok", crate::core::schema::InputType::Boolean);
        assert_eq!(d.column_type_sql(&flag), "BIT");
    }

    #[test]
    fn test_rename_uses_sp_rename() {
        let sql = MssqlDialect::new()
            .rename_table_sql(&table("swap_1"), &table("it's"))
            .unwrap();
        assert_eq!(sql, "EXEC sp_rename N'[dbo].[swap_1]', N'it''s'");
    }

    #[test]
    fn test_prepared_merge_sql() {
        let sql = MssqlDialect::new()
            .prepared_merge_sql(&table("users"), &schema(), &merge())
            .unwrap();
        assert_eq!(
            sql,
            "MERGE INTO [dbo].[users] AS T USING (SELECT @P1 AS [id], @P2 AS [name]) AS S \
             ON (T.[id] = S.[id]) WHEN MATCHED THEN UPDATE SET [name] = S.[name] \
             WHEN NOT MATCHED THEN INSERT ([id], [name]) VALUES (S.[id], S.[name]);"
        );
    }

    #[test]
    fn test_collect_merge_sql_terminated() {
        let sql = MssqlDialect::new()
            .collect_merge_sql(&[table("a"), table("b")], &schema(), &table("users"), &merge())
            .unwrap();
        assert!(sql.contains("USING (SELECT [id], [name] FROM [dbo].[a] UNION ALL"));
        assert!(sql.ends_with(';'));
    }

    #[test]
    fn test_tinyint_setter_override() {
        let overrides = MssqlDialect::new().setter_overrides();
        assert!(overrides.contains(&(SqlType::TinyInt, SetterKind::UnsignedByte)));
    }

    #[test]
    fn test_retryable_codes() {
        let d = MssqlDialect::new();
        assert!(d.is_retryable(&LoadError::database(None, Some(1205), "deadlock victim")));
        assert!(d.is_retryable(&LoadError::database(None, Some(1222), "lock request time out")));
        assert!(!d.is_retryable(&LoadError::database(None, Some(2627), "PK violation")));
    }
}
