//! MySQL SQL dialect.
//!
//! MySQL-specific syntax:
//! - Backtick identifier quoting
//! - `?` placeholders
//! - `INSERT ... ON DUPLICATE KEY UPDATE` instead of `MERGE`
//! - `RENAME TABLE a TO b`, several pairs at once for an atomic swap

use crate::coercion::SetterKind;
use crate::core::identifier::{quote_backtick, retired_table, LengthSemantics, TableIdentifier};
use crate::core::schema::{SqlType, TargetSchema};
use crate::core::traits::{
    merge_assignments, standard_sql_type_of, union_all_sql, Dialect, DialectFeatures, MergeConfig,
};
use crate::error::{LoadError, Result};

/// Deadlock found when trying to get lock; lock wait timeout exceeded.
const RETRYABLE_ERROR_CODES: &[i64] = &[1213, 1205];

const SETTER_OVERRIDES: &[(SqlType, SetterKind)] = &[(SqlType::Json, SetterKind::Json)];

/// MySQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    pub fn new() -> Self {
        Self
    }

    /// `ON DUPLICATE KEY UPDATE` assignment list; `source` renders the new value of a column.
    fn duplicate_key_update(
        &self,
        columns: &[String],
        merge: &MergeConfig,
        source: impl Fn(&str) -> String,
    ) -> Result<String> {
        if merge.merge_rule.is_some() {
            return Ok(merge_assignments(self, columns, merge, "")?.join(", "));
        }
        Ok(columns
            .iter()
            .map(|c| format!("{} = {}", c, source(c)))
            .collect::<Vec<_>>()
            .join(", "))
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_backtick(name)
    }

    fn features(&self) -> DialectFeatures {
        DialectFeatures {
            max_table_name_length: 64,
            length_semantics: LengthSemantics::Characters,
            ignore_merge_keys: true,
            ..DialectFeatures::default()
        }
    }

    fn convert_type_name(&self, type_name: &str) -> String {
        match type_name {
            "CLOB" => "TEXT".to_string(),
            // TIMESTAMP is limited to 2038 and auto-updates; DATETIME keeps microseconds.
            "TIMESTAMP" => "DATETIME(6)".to_string(),
            other => other.to_string(),
        }
    }

    fn sql_type_of(&self, type_name: &str) -> SqlType {
        match type_name.trim().to_ascii_lowercase().as_str() {
            "tinytext" | "text" | "mediumtext" | "longtext" => SqlType::LongVarChar,
            "tinyblob" | "blob" | "mediumblob" | "longblob" => SqlType::LongVarBinary,
            "datetime" | "timestamp" => SqlType::Timestamp,
            "year" => SqlType::SmallInt,
            "enum" | "set" => SqlType::VarChar,
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

    /// DDL commits implicitly, so the swap is one multi-table `RENAME TABLE`
    /// that parks the old target; dropping it afterwards is the only extra step.
    fn replace_table_sql(
        &self,
        from: &TableIdentifier,
        to: &TableIdentifier,
        target_exists: bool,
    ) -> Result<Vec<String>> {
        if !target_exists {
            return Ok(vec![self.rename_table_sql(from, to)?]);
        }
        let retired = retired_table(from);
        Ok(vec![
            self.drop_table_sql(&retired, true)?,
            format!(
                "RENAME TABLE {} TO {}, {} TO {}",
                self.quote_table(to)?,
                self.quote_table(&retired)?,
                self.quote_table(from)?,
                self.quote_table(to)?
            ),
            self.drop_table_sql(&retired, false)?,
        ])
    }

    fn rename_table_sql(&self, from: &TableIdentifier, to: &TableIdentifier) -> Result<String> {
        Ok(format!(
            "RENAME TABLE {} TO {}",
            self.quote_table(from)?,
            self.quote_table(to)?
        ))
    }

    fn prepared_merge_sql(
        &self,
        table: &TableIdentifier,
        schema: &TargetSchema,
        merge: &MergeConfig,
    ) -> Result<String> {
        let insert = self.prepared_insert_sql(table, schema)?;
        let columns = self.quoted_columns(schema)?;
        let update = self.duplicate_key_update(&columns, merge, |c| format!("VALUES({})", c))?;
        Ok(format!("{} ON DUPLICATE KEY UPDATE {}", insert, update))
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
        let update = self.duplicate_key_update(&columns, merge, |c| format!("S.{}", c))?;
        Ok(format!(
            "INSERT INTO {} ({}) SELECT * FROM ({}) AS S ON DUPLICATE KEY UPDATE {}",
            self.quote_table(to)?,
            columns.join(", "),
            union,
            update
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::TargetColumn;

    fn table(name: &str) -> TableIdentifier {
        TableIdentifier::new(None, name)
    }

    fn schema() -> TargetSchema {
        TargetSchema::new(vec![
            TargetColumn::generic("id", SqlType::BigInt, "BIGINT", 22, 0, true, true),
            TargetColumn::generic("name", SqlType::Clob, "CLOB", 4000, 0, false, false),
        ])
    }

    #[test]
    fn test_quote_ident() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.quote_ident("users").unwrap(), "`users`");
        assert_eq!(dialect.quote_ident("my`table").unwrap(), "`my``table`");
    }

    #[test]
    fn test_placeholder() {
        assert_eq!(MysqlDialect::new().placeholder(1), "?");
        assert_eq!(MysqlDialect::new().placeholder(100), "?");
    }

    #[test]
    fn test_type_names() {
        let d = MysqlDialect::new();
        assert_eq!(d.column_type_sql(&schema().columns[1]), "TEXT");
        let ts = TargetColumn::generic("at", SqlType::Timestamp, "TIMESTAMP", 26, 0, false, false);
        assert_eq!(d.column_type_sql(&ts), "DATETIME(6)");
    }

    #[test]
    fn test_prepared_merge_sql() {
        let sql = MysqlDialect::new()
            .prepared_merge_sql(&table("users"), &schema(), &MergeConfig::default())
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `users` (`id`, `name`) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE `id` = VALUES(`id`), `name` = VALUES(`name`)"
        );
    }

    #[test]
    fn test_collect_merge_sql() {
        let sql = MysqlDialect::new()
            .collect_merge_sql(&[table("a"), table("b")], &schema(), &table("users"), &MergeConfig::default())
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `users` (`id`, `name`) SELECT * FROM (SELECT `id`, `name` FROM `a` \
             UNION ALL SELECT `id`, `name` FROM `b`) AS S \
             ON DUPLICATE KEY UPDATE `id` = S.`id`, `name` = S.`name`"
        );
    }

    #[test]
    fn test_merge_rule() {
        let merge = MergeConfig {
            merge_keys: vec![],
            merge_rule: Some(vec!["`hits` = `hits` + VALUES(`hits`)".into()]),
        };
        let sql = MysqlDialect::new()
            .prepared_merge_sql(&table("users"), &schema(), &merge)
            .unwrap();
        assert!(sql.ends_with("ON DUPLICATE KEY UPDATE `hits` = `hits` + VALUES(`hits`)"));
    }

    #[test]
    fn test_replace_renames_both_tables_at_once() {
        let stmts = MysqlDialect::new()
            .replace_table_sql(&table("users_0000018f0a1b2c3d_bl"), &table("users"), true)
            .unwrap();
        assert_eq!(
            stmts,
            vec![
                "DROP TABLE IF EXISTS `users_0000018f0a1b2c3d_bo`".to_string(),
                "RENAME TABLE `users` TO `users_0000018f0a1b2c3d_bo`, \
                 `users_0000018f0a1b2c3d_bl` TO `users`"
                    .to_string(),
                "DROP TABLE `users_0000018f0a1b2c3d_bo`".to_string(),
            ]
        );
        // No target drop comes before the rename.
        assert!(stmts.iter().all(|s| s != "DROP TABLE `users`"));
    }

    #[test]
    fn test_replace_without_target_is_a_rename() {
        let stmts = MysqlDialect::new()
            .replace_table_sql(&table("swap"), &table("users"), false)
            .unwrap();
        assert_eq!(stmts, vec!["RENAME TABLE `swap` TO `users`".to_string()]);
    }

    #[test]
    fn test_retryable_codes() {
        let d = MysqlDialect::new();
        assert!(d.is_retryable(&LoadError::database(Some("40001"), Some(1213), "Deadlock found")));
        assert!(d.is_retryable(&LoadError::database(Some("HY000"), Some(1205), "Lock wait timeout")));
        assert!(!d.is_retryable(&LoadError::database(Some("23000"), Some(1062), "Duplicate entry")));
    }
}
