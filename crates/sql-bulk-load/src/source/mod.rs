//! JSON Lines record source used by the bundled runner.
//!
//! Each non-blank line is one record: either an object keyed by column name
//! (missing keys are NULL) or an array in input schema order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::config::InputConfig;
use crate::core::schema::{InputColumn, InputSchema, InputType};
use crate::core::value::{Record, Value};
use crate::error::{LoadError, Result};

/// Timestamp text accepted besides RFC 3339; read as UTC.
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Typed records read from a JSON Lines file.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
    schema: InputSchema,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>, schema: InputSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn from_config(input: &InputConfig) -> Self {
        let columns = input
            .columns
            .iter()
            .map(|c| InputColumn {
                name: c.name.clone(),
                input_type: c.input_type,
            })
            .collect();
        Self::new(&input.path, InputSchema::new(columns))
    }

    pub fn schema(&self) -> &InputSchema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file for reading records in order.
    pub async fn open(&self) -> Result<RecordReader> {
        let file = File::open(&self.path).await.map_err(|e| {
            LoadError::Config(format!("Cannot open input {}: {}", self.path.display(), e))
        })?;
        Ok(RecordReader {
            lines: BufReader::new(file).lines(),
            schema: self.schema.clone(),
            line_number: 0,
        })
    }
}

/// Sequential reader over one input file.
pub struct RecordReader {
    lines: Lines<BufReader<File>>,
    schema: InputSchema,
    line_number: usize,
}

impl RecordReader {
    /// Next record, or `None` at end of input. Blank lines are skipped.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            return parse_line(&self.schema, &line)
                .map(Some)
                .map_err(|e| LoadError::Config(format!("Input line {}: {}", self.line_number, e)));
        }
        Ok(None)
    }
}

/// Parse one JSON line into a record of `schema`.
pub fn parse_line(schema: &InputSchema, line: &str) -> std::result::Result<Record, String> {
    let json: JsonValue = serde_json::from_str(line).map_err(|e| e.to_string())?;
    match json {
        JsonValue::Object(mut map) => schema
            .columns
            .iter()
            .map(|c| convert(c, map.remove(&c.name).unwrap_or(JsonValue::Null)))
            .collect(),
        JsonValue::Array(values) => {
            if values.len() != schema.len() {
                return Err(format!(
                    "expected {} values, found {}",
                    schema.len(),
                    values.len()
                ));
            }
            schema
                .columns
                .iter()
                .zip(values)
                .map(|(c, v)| convert(c, v))
                .collect()
        }
        other => Err(format!("expected an object or an array, found {}", other)),
    }
}

fn convert(column: &InputColumn, json: JsonValue) -> std::result::Result<Value, String> {
    if json.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = |json: &JsonValue| {
        format!(
            "column '{}' expects {} but found {}",
            column.name, column.input_type, json
        )
    };
    let value = match column.input_type {
        InputType::Boolean => Value::Boolean(json.as_bool().ok_or_else(|| mismatch(&json))?),
        InputType::Long => Value::Long(json.as_i64().ok_or_else(|| mismatch(&json))?),
        InputType::Double => Value::Double(json.as_f64().ok_or_else(|| mismatch(&json))?),
        InputType::String => match json {
            JsonValue::String(s) => Value::String(s),
            other => return Err(mismatch(&other)),
        },
        InputType::Timestamp => Value::Timestamp(
            json.as_str()
                .and_then(parse_timestamp)
                .ok_or_else(|| mismatch(&json))?,
        ),
        InputType::Json => Value::Json(json),
    };
    Ok(value)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, NAIVE_TIMESTAMP_FORMAT)
        .ok()
        .map(|ts| ts.and_utc())
}
