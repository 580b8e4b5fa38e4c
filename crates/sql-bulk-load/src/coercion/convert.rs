//! Per-setter value conversion.
//!
//! Every function returns `None` when the input cannot be represented in the
//! target type. The caller turns `None` into the column's null value, so a
//! malformed value never fails the batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;

use crate::core::value::Value;

/// Round half away from zero and range-check into `[min, max]`.
fn double_to_integer(v: f64, min: i64, max: i64) -> Option<i64> {
    if !v.is_finite() {
        return None;
    }
    let rounded = v.round();
    if rounded < min as f64 || rounded >= max as f64 + 1.0 {
        return None;
    }
    Some(rounded as i64)
}

/// Integer of the `[min, max]` range, from any input type.
pub(crate) fn to_integer(value: &Value, min: i64, max: i64) -> Option<i64> {
    match value {
        Value::Boolean(b) => Some(i64::from(*b)),
        Value::Long(v) => (min..=max).contains(v).then_some(*v),
        Value::Double(v) => double_to_integer(*v, min, max),
        Value::String(s) => s.parse::<i64>().ok().filter(|v| (min..=max).contains(v)),
        Value::Null | Value::Timestamp(_) | Value::Json(_) => None,
    }
}

pub(crate) fn to_double(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Long(v) => *v as f64,
        Value::Double(v) => *v,
        Value::String(s) => s.parse::<f64>().ok()?,
        Value::Null | Value::Timestamp(_) | Value::Json(_) => return None,
    };
    v.is_finite().then_some(v)
}

pub(crate) fn to_float(value: &Value) -> Option<f32> {
    let v = to_double(value)? as f32;
    v.is_finite().then_some(v)
}

pub(crate) fn to_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Boolean(b) => Some(*b),
        Value::Long(v) => Some(*v > 0),
        Value::Double(v) => Some(*v > 0.0),
        Value::Null | Value::String(_) | Value::Timestamp(_) | Value::Json(_) => None,
    }
}

pub(crate) fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Boolean(b) => Some(Decimal::from(i64::from(*b))),
        Value::Long(v) => Some(Decimal::from(*v)),
        Value::Double(v) if v.is_finite() => Decimal::from_f64(*v),
        Value::String(s) => Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .ok(),
        _ => None,
    }
}

/// Canonical text of any non-null input.
pub(crate) fn to_text(value: &Value, format: &str, zone: Tz) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Boolean(b) => Some(b.to_string()),
        Value::Long(v) => Some(v.to_string()),
        // Debug keeps the trailing ".0" of integral doubles.
        Value::Double(v) => Some(format!("{:?}", v)),
        Value::String(s) => Some(s.clone()),
        Value::Timestamp(ts) => Some(format_timestamp(ts, format, zone)),
        Value::Json(j) => Some(j.to_string()),
    }
}

fn format_timestamp(ts: &DateTime<Utc>, format: &str, zone: Tz) -> String {
    ts.with_timezone(&zone).format(format).to_string()
}

pub(crate) fn to_local_timestamp(value: &Value, zone: Tz) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(ts) => Some(ts.with_timezone(&zone).naive_local()),
        _ => None,
    }
}

pub(crate) fn to_date(value: &Value, zone: Tz) -> Option<NaiveDate> {
    to_local_timestamp(value, zone).map(|ts| ts.date())
}

pub(crate) fn to_time(value: &Value, zone: Tz) -> Option<NaiveTime> {
    to_local_timestamp(value, zone).map(|ts| ts.time())
}

pub(crate) fn to_json(value: &Value) -> Option<JsonValue> {
    match value {
        Value::Boolean(b) => Some(JsonValue::Bool(*b)),
        Value::Long(v) => Some(JsonValue::from(*v)),
        Value::Double(v) => serde_json::Number::from_f64(*v).map(JsonValue::Number),
        Value::String(s) => serde_json::from_str(s).ok(),
        Value::Json(j) => Some(j.clone()),
        Value::Null | Value::Timestamp(_) => None,
    }
}
