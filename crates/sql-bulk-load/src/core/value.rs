//! Record values and bind values.
//!
//! [`Value`] is what the record source hands over: one of the six generic
//! input types. [`BindValue`] is what a column setter produces for a specific
//! destination column, already converted to the width and representation the
//! driver binds.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use crate::core::schema::{InputType, SqlType};

/// One input value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Generic type of this value, `None` for NULL.
    pub fn input_type(&self) -> Option<InputType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(InputType::Boolean),
            Value::Long(_) => Some(InputType::Long),
            Value::Double(_) => Some(InputType::Double),
            Value::String(_) => Some(InputType::String),
            Value::Timestamp(_) => Some(InputType::Timestamp),
            Value::Json(_) => Some(InputType::Json),
        }
    }
}

/// One row of input values, in input schema order.
pub type Record = Vec<Value>;

/// A value converted for one destination column.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    /// NULL with the column's SQL type, for drivers that need a typed NULL.
    Null(SqlType),

    Bool(bool),

    /// 8-bit signed integer (tinyint).
    I8(i8),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real/float4).
    F32(f32),

    /// 64-bit floating point (double precision/float8).
    F64(f64),

    Decimal(Decimal),

    Text(String),

    /// National character text (NCHAR / NVARCHAR).
    NText(String),

    Bytes(Vec<u8>),

    Date(NaiveDate),

    Time(NaiveTime),

    /// Timestamp without timezone, already shifted into the column's timezone.
    Timestamp(NaiveDateTime),

    /// Timestamp with timezone.
    TimestampTz(DateTime<Utc>),

    Json(JsonValue),
}

impl BindValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, BindValue::Null(_))
    }

    /// Estimated buffered size of this value in bytes, excluding the fixed
    /// per-column overhead. Over-estimates on purpose; only used to schedule flushes.
    #[must_use]
    pub fn weight(&self) -> u64 {
        match self {
            BindValue::Null(_) => 0,
            BindValue::Bool(_) | BindValue::I8(_) => 1,
            BindValue::I16(_) => 2,
            BindValue::I32(_) | BindValue::F32(_) => 4,
            BindValue::I64(_) | BindValue::F64(_) => 8,
            BindValue::Decimal(d) => decimal_weight(d),
            BindValue::Text(s) | BindValue::NText(s) => s.chars().count() as u64 * 2 + 4,
            BindValue::Bytes(b) => b.len() as u64 + 4,
            BindValue::Json(j) => j.to_string().chars().count() as u64 * 2 + 4,
            BindValue::Date(_)
            | BindValue::Time(_)
            | BindValue::Timestamp(_)
            | BindValue::TimestampTz(_) => 32,
        }
    }
}

/// Half the digit count (rounded down to even first) plus 8.
fn decimal_weight(d: &Decimal) -> u64 {
    let digits = d.mantissa().unsigned_abs().to_string().len() as u64;
    (digits & !2) / 2 + 8
}

impl From<bool> for BindValue {
    fn from(v: bool) -> Self {
        BindValue::Bool(v)
    }
}

impl From<i32> for BindValue {
    fn from(v: i32) -> Self {
        BindValue::I32(v)
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::I64(v)
    }
}

impl From<f64> for BindValue {
    fn from(v: f64) -> Self {
        BindValue::F64(v)
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Text(v)
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Text(v.to_string())
    }
}

impl From<Decimal> for BindValue {
    fn from(v: Decimal) -> Self {
        BindValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for BindValue {
    fn from(v: NaiveDateTime) -> Self {
        BindValue::Timestamp(v)
    }
}
