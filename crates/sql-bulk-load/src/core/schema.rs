//! Input and target schema metadata.
//!
//! The input side is the ordered, typed column list produced by the record
//! source. The target side is what the destination table looks like, either
//! introspected from an existing table or derived from the input for a table
//! that is about to be created.

use crate::config::{ColumnMatching, ColumnOption};
use crate::error::{LoadError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Generic type of an input column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Boolean,
    Long,
    Double,
    String,
    Timestamp,
    Json,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputType::Boolean => "boolean",
            InputType::Long => "long",
            InputType::Double => "double",
            InputType::String => "string",
            InputType::Timestamp => "timestamp",
            InputType::Json => "json",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputColumn {
    pub name: String,
    pub input_type: InputType,
}

/// Ordered input columns. Immutable for the duration of one load.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputSchema {
    pub columns: Vec<InputColumn>,
}

impl InputSchema {
    pub fn new(columns: Vec<InputColumn>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Destination SQL type, the driver-neutral equivalent of `java.sql.Types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Numeric,
    Decimal,
    Boolean,
    Char,
    VarChar,
    LongVarChar,
    Clob,
    NChar,
    NVarChar,
    LongNVarChar,
    NClob,
    Binary,
    VarBinary,
    LongVarBinary,
    Blob,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Null,
    Other,
}

/// One column of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    /// `None` marks a skip column: the matching input column is not written.
    pub name: Option<String>,
    pub sql_type: SqlType,
    /// Type name without size parameters, e.g. `VARCHAR`.
    pub simple_type_name: String,
    pub size: i32,
    pub scale: i32,
    /// Full declared type used verbatim in CREATE TABLE (column option `type`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
    pub not_null: bool,
    pub unique_key: bool,
}

impl TargetColumn {
    pub fn generic(
        name: impl Into<String>,
        sql_type: SqlType,
        simple_type_name: impl Into<String>,
        size: i32,
        scale: i32,
        not_null: bool,
        unique_key: bool,
    ) -> Self {
        Self {
            name: Some(name.into()),
            sql_type,
            simple_type_name: simple_type_name.into(),
            size,
            scale,
            declared_type: None,
            not_null,
            unique_key,
        }
    }

    /// Column whose DDL type is given verbatim. Nullability and key flags are ignored.
    pub fn declared(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            sql_type: SqlType::Other,
            simple_type_name: String::new(),
            size: 0,
            scale: 0,
            declared_type: Some(declared_type.into()),
            not_null: false,
            unique_key: false,
        }
    }

    pub fn skip() -> Self {
        Self {
            name: None,
            sql_type: SqlType::Null,
            simple_type_name: String::new(),
            size: 0,
            scale: 0,
            declared_type: None,
            not_null: false,
            unique_key: false,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.name.is_none()
    }

    /// Column name, empty for skip columns.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Generic column for a new table holding values of `input_type`.
    pub fn for_input(name: &str, input_type: InputType) -> Self {
        match input_type {
            InputType::Boolean => {
                Self::generic(name, SqlType::Boolean, "BOOLEAN", 1, 0, false, false)
            }
            InputType::Long => Self::generic(name, SqlType::BigInt, "BIGINT", 22, 0, false, false),
            InputType::Double => {
                Self::generic(name, SqlType::Float, "DOUBLE PRECISION", 24, 0, false, false)
            }
            InputType::String | InputType::Json => {
                Self::generic(name, SqlType::Clob, "CLOB", 4000, 0, false, false)
            }
            InputType::Timestamp => {
                Self::generic(name, SqlType::Timestamp, "TIMESTAMP", 26, 0, false, false)
            }
        }
    }
}

/// Ordered destination columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetSchema {
    pub columns: Vec<TargetColumn>,
}

impl TargetSchema {
    pub fn new(columns: Vec<TargetColumn>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Schema of a table created for `input`, honoring per-column `type` overrides.
    pub fn for_new_table(input: &InputSchema, options: &BTreeMap<String, ColumnOption>) -> Self {
        let columns = input
            .columns
            .iter()
            .map(|c| match column_option(options, &c.name).and_then(|o| o.type_name.as_ref()) {
                Some(declared) => TargetColumn::declared(&c.name, declared),
                None => TargetColumn::for_input(&c.name, c.input_type),
            })
            .collect();
        Self { columns }
    }

    /// Find a column by name: exact match first, then a unique
    /// case-insensitive match. Both `id` and `ID` matching is an error.
    pub fn find_column(&self, name: &str) -> Result<Option<&TargetColumn>> {
        if let Some(c) = self.columns.iter().find(|c| c.name() == name) {
            return Ok(Some(c));
        }

        let lowered = name.to_lowercase();
        let mut found: Option<&TargetColumn> = None;
        for c in self.columns.iter().filter(|c| !c.is_skip()) {
            if c.name().to_lowercase() == lowered {
                if let Some(prev) = found {
                    return Err(LoadError::Config(format!(
                        "Cannot specify column '{}' because both '{}' and '{}' exist.",
                        name,
                        prev.name(),
                        c.name()
                    )));
                }
                found = Some(c);
            }
        }
        Ok(found)
    }

    /// Columns that are actually written, in order.
    pub fn insert_schema(&self) -> TargetSchema {
        TargetSchema {
            columns: self.columns.iter().filter(|c| !c.is_skip()).cloned().collect(),
        }
    }

    /// Names of the unique-key columns.
    pub fn unique_key_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.unique_key && !c.is_skip())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Reconcile `input` against this (introspected) schema. The result has one
    /// entry per input column; input columns with no counterpart become skip columns.
    pub fn match_input(&self, input: &InputSchema, matching: ColumnMatching) -> Result<TargetSchema> {
        let mut columns = Vec::with_capacity(input.len());
        for (i, input_column) in input.columns.iter().enumerate() {
            let matched = match matching {
                ColumnMatching::ByName => self.find_column(&input_column.name)?.cloned(),
                ColumnMatching::ByPosition => self.columns.get(i).cloned(),
            };
            match matched {
                Some(c) => columns.push(c),
                None => {
                    warn!(
                        "Input column '{}' has no matching target column and will not be written",
                        input_column.name
                    );
                    columns.push(TargetColumn::skip());
                }
            }
        }

        let matched = TargetSchema { columns };
        if matched.insert_schema().is_empty() {
            return Err(LoadError::Config(
                "No input column matches a column of the target table".into(),
            ));
        }
        Ok(matched)
    }
}

/// Column option lookup by exact name, then unique case-insensitive name.
pub fn column_option<'a>(
    options: &'a BTreeMap<String, ColumnOption>,
    name: &str,
) -> Option<&'a ColumnOption> {
    if let Some(o) = options.get(name) {
        return Some(o);
    }
    let mut matches = options
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v);
    match (matches.next(), matches.next()) {
        (Some(o), None) => Some(o),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, sql_type: SqlType, unique: bool) -> TargetColumn {
        TargetColumn::generic(name, sql_type, "X", 0, 0, false, unique)
    }

    fn input(cols: &[(&str, InputType)]) -> InputSchema {
        InputSchema::new(
            cols.iter()
                .map(|(n, t)| InputColumn {
                    name: n.to_string(),
                    input_type: *t,
                })
                .collect(),
        )
    }

    #[test]
    fn test_find_column_exact_then_case_insensitive() {
        let schema = TargetSchema::new(vec![
            col("id", SqlType::Integer, true),
            col("Name", SqlType::VarChar, false),
        ]);
        assert_eq!(schema.find_column("id").unwrap().unwrap().name(), "id");
        assert_eq!(schema.find_column("NAME").unwrap().unwrap().name(), "Name");
        assert!(schema.find_column("missing").unwrap().is_none());
    }

    #[test]
    fn test_find_column_ambiguous() {
        let schema = TargetSchema::new(vec![
            col("id", SqlType::Integer, false),
            col("ID", SqlType::Integer, false),
        ]);
        assert_eq!(schema.find_column("ID").unwrap().unwrap().name(), "ID");
        let err = schema.find_column("Id").unwrap_err();
        assert!(err.to_string().contains("both 'id' and 'ID' exist"));
    }

    #[test]
    fn test_match_by_name_reorders_and_skips() {
        let target = TargetSchema::new(vec![
            col("b", SqlType::VarChar, false),
            col("a", SqlType::BigInt, true),
        ]);
        let matched = target
            .match_input(
                &input(&[
                    ("a", InputType::Long),
                    ("extra", InputType::String),
                    ("b", InputType::String),
                ]),
                ColumnMatching::ByName,
            )
            .unwrap();
        assert_eq!(matched.len(), 3);
        assert_eq!(matched.columns[0].name(), "a");
        assert!(matched.columns[1].is_skip());
        assert_eq!(matched.columns[2].name(), "b");

        let insert = matched.insert_schema();
        assert_eq!(insert.len(), 2);
        assert_eq!(insert.unique_key_names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_match_by_position() {
        let target = TargetSchema::new(vec![
            col("x", SqlType::BigInt, false),
            col("y", SqlType::VarChar, false),
        ]);
        let matched = target
            .match_input(
                &input(&[
                    ("a", InputType::Long),
                    ("b", InputType::String),
                    ("c", InputType::String),
                ]),
                ColumnMatching::ByPosition,
            )
            .unwrap();
        assert_eq!(matched.columns[0].name(), "x");
        assert_eq!(matched.columns[1].name(), "y");
        assert!(matched.columns[2].is_skip());
    }

    #[test]
    fn test_match_with_nothing_in_common() {
        let target = TargetSchema::new(vec![col("x", SqlType::BigInt, false)]);
        let err = target
            .match_input(&input(&[("a", InputType::Long)]), ColumnMatching::ByName)
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn test_for_new_table_types_and_overrides() {
        let mut options = BTreeMap::new();
        options.insert(
            "code".to_string(),
            ColumnOption {
                type_name: Some("VARCHAR(8)".to_string()),
                ..Default::default()
            },
        );
        let schema = TargetSchema::for_new_table(
            &input(&[
                ("code", InputType::String),
                ("n", InputType::Long),
                ("ok", InputType::Boolean),
                ("at", InputType::Timestamp),
                ("doc", InputType::Json),
                ("x", InputType::Double),
            ]),
            &options,
        );
        assert_eq!(schema.columns[0].declared_type.as_deref(), Some("VARCHAR(8)"));
        assert_eq!(schema.columns[1].simple_type_name, "BIGINT");
        assert_eq!(schema.columns[2].sql_type, SqlType::Boolean);
        assert_eq!(schema.columns[3].simple_type_name, "TIMESTAMP");
        assert_eq!(schema.columns[4].simple_type_name, "CLOB");
        assert_eq!(schema.columns[5].simple_type_name, "DOUBLE PRECISION");
    }

    #[test]
    fn test_column_option_case_insensitive() {
        let mut options = BTreeMap::new();
        options.insert("Code".to_string(), ColumnOption::default());
        assert!(column_option(&options, "code").is_some());
        options.insert("CODE".to_string(), ColumnOption::default());
        assert!(column_option(&options, "code").is_none());
        assert!(column_option(&options, "CODE").is_some());
    }
}
