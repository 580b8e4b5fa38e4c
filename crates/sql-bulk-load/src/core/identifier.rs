//! Table identifiers, identifier quoting, and intermediate table naming.
//!
//! SQL identifiers (table names, column names, schema names) cannot be passed as
//! parameters in prepared statements - only data values can be parameterized.
//! To safely construct dynamic SQL with identifiers, we:
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Apply database-specific quoting (brackets, double quotes, backticks)
//! 3. Escape special characters within the quotes

use crate::error::{LoadError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - SQL Server: 128 characters
/// - MySQL: 64 characters
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Marker placed between the transaction-unique part and the worker index.
const INTERMEDIATE_SUFFIX: &str = "_bl";

/// Replaces [`INTERMEDIATE_SUFFIX`] in the name of a replaced target that is
/// parked while the swap table takes its place.
const RETIRED_SUFFIX: &str = "_bo";

/// Hex digits of the transaction-unique part that survive truncation.
const MIN_UNIQUE_DIGITS: usize = 8;

/// Minimum width of the worker index suffix.
const MIN_WORKER_SUFFIX_WIDTH: usize = 3;

/// Database / schema / table triple naming one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
}

impl TableIdentifier {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            database: None,
            schema,
            table: table.into(),
        }
    }

    /// Same database and schema, different table name.
    pub fn with_table(&self, table: impl Into<String>) -> Self {
        Self {
            database: self.database.clone(),
            schema: self.schema.clone(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = &self.database {
            write!(f, "{}.", db)?;
        }
        if let Some(schema) = &self.schema {
            write!(f, "{}.", schema)?;
        }
        f.write_str(&self.table)
    }
}

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes, and
/// identifiers exceeding [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LoadError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(LoadError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(LoadError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an ANSI / PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
pub fn quote_double(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_backtick(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote a SQL Server identifier using brackets.
pub fn quote_bracket(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// How a dialect measures identifier length against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSemantics {
    /// UTF-8 bytes (PostgreSQL NAMEDATALEN).
    Bytes,
    /// Unicode scalar values.
    Characters,
}

impl LengthSemantics {
    pub fn count(self, s: &str) -> usize {
        match self {
            LengthSemantics::Bytes => s.len(),
            LengthSemantics::Characters => s.chars().count(),
        }
    }
}

/// Width of the zero-padded hex worker index for `worker_count` workers.
pub fn worker_suffix_width(worker_count: usize) -> usize {
    let last = worker_count.saturating_sub(1);
    let digits = format!("{:x}", last).len();
    digits.max(MIN_WORKER_SUFFIX_WIDTH)
}

/// Build the transaction-unique prefix `<table>_<16 hex millis>_bl`, truncated so
/// that prefix plus a `suffix_width` worker index fits in `max_length`.
///
/// The unique part is shortened first (keeping at least 8 hex digits), then the
/// base table name, one character at a time.
pub fn intermediate_table_prefix(
    base_table: &str,
    unique_millis: u64,
    suffix_width: usize,
    max_length: usize,
    semantics: LengthSemantics,
) -> Result<String> {
    let mut table: Vec<char> = base_table.chars().collect();
    let mut unique: String = format!("{:016x}", unique_millis);

    loop {
        let table_part: String = table.iter().collect();
        let candidate = format!("{}_{}{}", table_part, unique, INTERMEDIATE_SUFFIX);
        if semantics.count(&candidate) + suffix_width <= max_length {
            return Ok(candidate);
        }
        if unique.len() > MIN_UNIQUE_DIGITS {
            unique.remove(0);
        } else if table.pop().is_none() {
            return Err(LoadError::Config(format!(
                "Table name '{}' is too long to generate an intermediate table name",
                base_table
            )));
        }
    }
}

/// Name of the intermediate table of one worker.
pub fn worker_table_name(prefix: &str, worker_index: usize, suffix_width: usize) -> String {
    format!("{}{:0width$x}", prefix, worker_index, width = suffix_width)
}

/// Where a replaced target is parked during a swap: the swap table's name
/// with `_bl` turned into `_bo`, so it is just as long and just as unique.
pub fn retired_table(swap: &TableIdentifier) -> TableIdentifier {
    let stem = swap
        .table
        .strip_suffix(INTERMEDIATE_SUFFIX)
        .unwrap_or(&swap.table);
    swap.with_table(format!("{}{}", stem, RETIRED_SUFFIX))
}
