//! Column coercion: input values to destination bind values.
//!
//! A [`SetterFactory`] picks one [`SetterKind`] per target column, either from
//! the column's `value_type` option or by coercing the column's SQL type
//! through the dialect's override map and then the default table. The
//! resulting [`ColumnSetter`] converts each input [`Value`] with a single
//! `match`, falling back to the column's null value whenever the conversion
//! would lose the value.

mod convert;

use chrono::format::{Item, StrftimeItems};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ColumnOption;
use crate::core::schema::{column_option, InputColumn, SqlType, TargetColumn};
use crate::core::value::{BindValue, Value};
use crate::error::{LoadError, Result};

/// Concrete setter for one target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetterKind {
    Byte,
    /// 0..=255, bound as a 16-bit integer (SQL Server TINYINT).
    UnsignedByte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Boolean,
    String,
    NString,
    Date,
    Time,
    Timestamp,
    Decimal,
    Json,
    /// Always binds NULL.
    Null,
    /// The input column is not written.
    Skip,
    /// Binds the input value with its own type.
    PassThrough,
}

impl SetterKind {
    /// Setter named by a `value_type` column option. `coerce` is not a setter
    /// name; it asks the factory to choose.
    pub fn from_value_type(name: &str) -> Option<SetterKind> {
        let kind = match name {
            "byte" => SetterKind::Byte,
            "short" => SetterKind::Short,
            "int" => SetterKind::Int,
            "long" => SetterKind::Long,
            "double" => SetterKind::Double,
            "float" => SetterKind::Float,
            "boolean" => SetterKind::Boolean,
            "string" => SetterKind::String,
            "nstring" => SetterKind::NString,
            "date" => SetterKind::Date,
            "time" => SetterKind::Time,
            "timestamp" => SetterKind::Timestamp,
            "decimal" => SetterKind::Decimal,
            "json" => SetterKind::Json,
            "null" => SetterKind::Null,
            "pass" => SetterKind::PassThrough,
            _ => return None,
        };
        Some(kind)
    }

    /// Closest setter for a SQL type.
    pub fn coerce(sql_type: SqlType) -> Option<SetterKind> {
        let kind = match sql_type {
            SqlType::TinyInt => SetterKind::Byte,
            SqlType::SmallInt => SetterKind::Short,
            SqlType::Integer => SetterKind::Int,
            SqlType::BigInt => SetterKind::Long,
            SqlType::Double | SqlType::Float => SetterKind::Double,
            SqlType::Real => SetterKind::Float,
            SqlType::Boolean | SqlType::Bit => SetterKind::Boolean,
            SqlType::Char | SqlType::VarChar | SqlType::LongVarChar | SqlType::Clob => {
                SetterKind::String
            }
            SqlType::NChar | SqlType::NVarChar | SqlType::LongNVarChar | SqlType::NClob => {
                SetterKind::NString
            }
            SqlType::Date => SetterKind::Date,
            SqlType::Time => SetterKind::Time,
            SqlType::Timestamp | SqlType::TimestampTz => SetterKind::Timestamp,
            SqlType::Numeric | SqlType::Decimal => SetterKind::Decimal,
            SqlType::Null => SetterKind::Null,
            SqlType::Binary
            | SqlType::VarBinary
            | SqlType::LongVarBinary
            | SqlType::Blob
            | SqlType::Json
            | SqlType::Other => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for SetterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetterKind::Byte => "byte",
            SetterKind::UnsignedByte => "unsigned byte",
            SetterKind::Short => "short",
            SetterKind::Int => "int",
            SetterKind::Long => "long",
            SetterKind::Float => "float",
            SetterKind::Double => "double",
            SetterKind::Boolean => "boolean",
            SetterKind::String => "string",
            SetterKind::NString => "nstring",
            SetterKind::Date => "date",
            SetterKind::Time => "time",
            SetterKind::Timestamp => "timestamp",
            SetterKind::Decimal => "decimal",
            SetterKind::Json => "json",
            SetterKind::Null => "null",
            SetterKind::Skip => "skip",
            SetterKind::PassThrough => "pass",
        };
        f.write_str(name)
    }
}

/// Converts input values for one target column.
#[derive(Debug, Clone)]
pub struct ColumnSetter {
    kind: SetterKind,
    sql_type: SqlType,
    timestamp_format: String,
    zone: Tz,
}

impl ColumnSetter {
    pub fn new(kind: SetterKind, sql_type: SqlType, timestamp_format: String, zone: Tz) -> Self {
        Self {
            kind,
            sql_type,
            timestamp_format,
            zone,
        }
    }

    pub fn kind(&self) -> SetterKind {
        self.kind
    }

    pub fn is_skip(&self) -> bool {
        self.kind == SetterKind::Skip
    }

    /// Value written when the input is NULL or cannot be converted.
    pub fn null_value(&self) -> BindValue {
        BindValue::Null(self.sql_type)
    }

    /// Convert one input value. Returns `None` for skip columns, which bind nothing.
    pub fn bind(&self, value: &Value) -> Option<BindValue> {
        if self.is_skip() {
            return None;
        }
        if value.is_null() {
            return Some(self.null_value());
        }
        Some(self.convert(value).unwrap_or_else(|| self.null_value()))
    }

    fn convert(&self, value: &Value) -> Option<BindValue> {
        let zone = self.zone;
        match self.kind {
            SetterKind::Byte => {
                convert::to_integer(value, i8::MIN.into(), i8::MAX.into()).map(|v| BindValue::I8(v as i8))
            }
            SetterKind::UnsignedByte => {
                convert::to_integer(value, 0, u8::MAX.into()).map(|v| BindValue::I16(v as i16))
            }
            SetterKind::Short => convert::to_integer(value, i16::MIN.into(), i16::MAX.into())
                .map(|v| BindValue::I16(v as i16)),
            SetterKind::Int => convert::to_integer(value, i32::MIN.into(), i32::MAX.into())
                .map(|v| BindValue::I32(v as i32)),
            SetterKind::Long => convert::to_integer(value, i64::MIN, i64::MAX).map(BindValue::I64),
            SetterKind::Float => convert::to_float(value).map(BindValue::F32),
            SetterKind::Double => convert::to_double(value).map(BindValue::F64),
            SetterKind::Boolean => convert::to_boolean(value).map(BindValue::Bool),
            SetterKind::String => {
                convert::to_text(value, &self.timestamp_format, zone).map(BindValue::Text)
            }
            SetterKind::NString => {
                convert::to_text(value, &self.timestamp_format, zone).map(BindValue::NText)
            }
            SetterKind::Decimal => convert::to_decimal(value).map(BindValue::Decimal),
            SetterKind::Date => convert::to_date(value, zone).map(BindValue::Date),
            SetterKind::Time => convert::to_time(value, zone).map(BindValue::Time),
            SetterKind::Timestamp => match (value, self.sql_type) {
                (Value::Timestamp(ts), SqlType::TimestampTz) => Some(BindValue::TimestampTz(*ts)),
                _ => convert::to_local_timestamp(value, zone).map(BindValue::Timestamp),
            },
            SetterKind::Json => convert::to_json(value).map(BindValue::Json),
            SetterKind::Null | SetterKind::Skip => None,
            SetterKind::PassThrough => Some(match value {
                Value::Null => self.null_value(),
                Value::Boolean(b) => BindValue::Bool(*b),
                Value::Long(v) => BindValue::I64(*v),
                Value::Double(v) => BindValue::F64(*v),
                Value::String(s) => BindValue::Text(s.clone()),
                Value::Timestamp(ts) => BindValue::Timestamp(ts.with_timezone(&zone).naive_local()),
                Value::Json(j) => BindValue::Text(j.to_string()),
            }),
        }
    }
}

/// Builds [`ColumnSetter`]s from column options and a dialect's override map.
#[derive(Debug, Clone)]
pub struct SetterFactory {
    overrides: &'static [(SqlType, SetterKind)],
    column_options: BTreeMap<String, ColumnOption>,
    default_timestamp_format: String,
    default_timezone: String,
}

impl SetterFactory {
    pub fn new(
        overrides: &'static [(SqlType, SetterKind)],
        column_options: BTreeMap<String, ColumnOption>,
        default_timestamp_format: impl Into<String>,
        default_timezone: impl Into<String>,
    ) -> Self {
        Self {
            overrides,
            column_options,
            default_timestamp_format: default_timestamp_format.into(),
            default_timezone: default_timezone.into(),
        }
    }

    /// Setter for writing `input` into `target`.
    pub fn create(&self, input: &InputColumn, target: &TargetColumn) -> Result<ColumnSetter> {
        let option = column_option(&self.column_options, &input.name);
        let format = option
            .and_then(|o| o.timestamp_format.clone())
            .unwrap_or_else(|| self.default_timestamp_format.clone());
        let zone_name = option
            .and_then(|o| o.timezone.as_deref())
            .unwrap_or(&self.default_timezone);
        let zone = parse_timezone(zone_name)?;
        check_timestamp_format(&format)?;

        if target.is_skip() {
            return Ok(ColumnSetter::new(SetterKind::Skip, SqlType::Null, format, zone));
        }

        let value_type = option.map(|o| o.value_type.as_str()).unwrap_or("coerce");
        let kind = if value_type == "coerce" {
            self.coerce(target)?
        } else {
            SetterKind::from_value_type(value_type).ok_or_else(|| {
                LoadError::Config(format!(
                    "Unknown value_type '{}' for column '{}'",
                    value_type, input.name
                ))
            })?
        };
        Ok(ColumnSetter::new(kind, target.sql_type, format, zone))
    }

    fn coerce(&self, target: &TargetColumn) -> Result<SetterKind> {
        self.overrides
            .iter()
            .find(|(sql_type, _)| *sql_type == target.sql_type)
            .map(|(_, kind)| *kind)
            .or_else(|| SetterKind::coerce(target.sql_type))
            .ok_or_else(|| {
                LoadError::Config(format!(
                    "Unsupported type {} of column '{}' ({:?}); set column_options.{}.value_type",
                    target.simple_type_name,
                    target.name(),
                    target.sql_type,
                    target.name()
                ))
            })
    }
}

fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| LoadError::Config(format!("Unknown timezone '{}': {}", name, e)))
}

/// Reject strftime strings chrono cannot render; formatting them would panic.
pub(crate) fn check_timestamp_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(LoadError::Config(format!(
            "Invalid timestamp format '{}'",
            format
        )));
    }
    Ok(())
}
