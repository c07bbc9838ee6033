//! Canonical data points
//!
//! Push messages and history responses describe a reading in slightly
//! different shapes:
//!
//! ```text
//! {"value": 5, "timestamp": 100}                          history item
//! {"data": "560", "timestamp": "1404150843000", ...}       push DataPoint
//! {"currentValue": {"value": 5, "timestamp": "100"}, ...}  stream summary
//! ```
//!
//! [`normalize_item`] turns any of them into a [`DataPoint`] or rejects the
//! item. A rejected item is dropped by the caller; a malformed point is
//! never delivered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

use super::error::PointError;

/// Wrapper field holding the reading one level down
pub const CURRENT_VALUE_FIELD: &str = "currentValue";

/// Scalar value of a data point, kept in the type it arrived as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl PointValue {
    fn from_json(value: &Value) -> Result<Self, PointError> {
        match value {
            Value::Bool(b) => Ok(PointValue::Bool(*b)),
            Value::Number(n) => Ok(PointValue::Number(n.clone())),
            Value::String(s) => Ok(PointValue::Text(s.clone())),
            other => Err(PointError::UnsupportedValue(json_type(other).to_string())),
        }
    }

    /// Numeric view of the value; text is parsed, booleans map to 0/1
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PointValue::Number(n) => n.as_f64(),
            PointValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<f64> for PointValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value)
            .map(PointValue::Number)
            .unwrap_or_else(|| PointValue::Text(value.to_string()))
    }
}

impl From<i64> for PointValue {
    fn from(value: i64) -> Self {
        PointValue::Number(value.into())
    }
}

impl From<&str> for PointValue {
    fn from(value: &str) -> Self {
        PointValue::Text(value.to_string())
    }
}

impl From<bool> for PointValue {
    fn from(value: bool) -> Self {
        PointValue::Bool(value)
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Bool(b) => write!(f, "{}", b),
            PointValue::Number(n) => write!(f, "{}", n),
            PointValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A normalized reading, the only shape delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub value: PointValue,
    /// Epoch milliseconds as reported by the device cloud
    pub timestamp: i64,
}

impl DataPoint {
    pub fn new(value: impl Into<PointValue>, timestamp: i64) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

/// Normalize one raw item into a [`DataPoint`]
///
/// Unwraps a `currentValue` object first. The value is read from `value`,
/// or from `data` for push payloads.
pub fn normalize_item(raw: &Value) -> Result<DataPoint, PointError> {
    let item = unwrap_current_value(raw)?;

    let timestamp = item
        .get("timestamp")
        .ok_or(PointError::MissingField("timestamp"))
        .and_then(parse_timestamp)?;

    let value = item
        .get("value")
        .or_else(|| item.get("data"))
        .ok_or(PointError::MissingField("value"))
        .and_then(PointValue::from_json)?;

    Ok(DataPoint { value, timestamp })
}

/// Step into the `currentValue` wrapper if the item has one
pub fn unwrap_current_value(raw: &Value) -> Result<&Map<String, Value>, PointError> {
    let obj = raw.as_object().ok_or(PointError::NotAnObject)?;
    match obj.get(CURRENT_VALUE_FIELD) {
        Some(inner) => inner.as_object().ok_or(PointError::NotAnObject),
        None => Ok(obj),
    }
}

/// Read a timestamp: integers as-is, strings parsed by leading integer
pub fn parse_timestamp(raw: &Value) -> Result<i64, PointError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| PointError::BadTimestamp(n.to_string())),
        Value::String(s) => {
            parse_int_prefix(s).ok_or_else(|| PointError::BadTimestamp(s.clone()))
        }
        other => Err(PointError::BadTimestamp(other.to_string())),
    }
}

/// Items of a `{items: [...]}` history response
///
/// A bare array is accepted as the item list; anything else has no items.
pub fn history_items(response: &Value) -> &[Value] {
    match response {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

/// Integer parse of the leading digits, ignoring surrounding whitespace
/// and trailing garbage ("111" → 111, " -5s" → -5, "aa" → None)
fn parse_int_prefix(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
