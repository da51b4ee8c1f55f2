//! Request parameter values
//!
//! Artifact requests carry an open-ended set of named parameters (a reference
//! date, an index symbol, a company code). Values keep their type through
//! persistence: the JSON form is explicitly tagged, so a date never comes
//! back as a plain string.

use crate::error::{CommonError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Parameter set keyed by name. Ordered, so iteration is already canonical.
pub type Params = BTreeMap<String, ParamValue>;

/// A single request parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl ParamValue {
    /// Date carried by this value, if it is date-like.
    ///
    /// Text values count when they start with an ISO `YYYY-MM-DD` date.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParamValue::Date(d) => Some(*d),
            ParamValue::DateTime(dt) => Some(dt.date()),
            ParamValue::Text(s) => s
                .get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()),
            _ => None,
        }
    }

    /// Render the value with a `chrono` format when it is date-like,
    /// otherwise with its plain display form.
    ///
    /// The format is checked for every value type, so a bad template fails
    /// the same way whatever the parameter holds.
    pub fn format_with(&self, date_format: &str) -> Result<String> {
        if StrftimeItems::new(date_format).any(|item| matches!(item, Item::Error)) {
            return Err(CommonError::invalid_value(format!(
                "invalid date format '{}'",
                date_format
            )));
        }

        let mut out = String::new();
        let written = match self {
            ParamValue::DateTime(dt) => write!(out, "{}", dt.format(date_format)),
            other => match other.as_date() {
                Some(d) => write!(out, "{}", d.format(date_format)),
                None => write!(out, "{}", other),
            },
        };
        written.map_err(|_| {
            CommonError::invalid_value(format!("invalid date format '{}'", date_format))
        })?;
        Ok(out)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Text(_) => "text",
            ParamValue::Integer(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::Bool(_) => "bool",
            ParamValue::Date(_) => "date",
            ParamValue::DateTime(_) => "date_time",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => write!(f, "{}", s),
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            // sub-second digits only appear when present
            ParamValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Integer(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        ParamValue::Date(value)
    }
}

impl From<NaiveDateTime> for ParamValue {
    fn from(value: NaiveDateTime) -> Self {
        ParamValue::DateTime(value)
    }
}
