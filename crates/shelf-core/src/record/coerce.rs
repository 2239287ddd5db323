//! Value coercion from loosely typed source cells.
//!
//! Each coercer returns `Ok(None)` for a blank cell (null, empty string or
//! empty list), `Ok(Some(..))` for a usable value and `Err(reason)` when the
//! cell cannot be read as the requested kind.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::model::FieldValue;
use super::schema::FieldKind;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

pub fn coerce(kind: FieldKind, raw: &Value) -> Result<Option<FieldValue>, String> {
    match kind {
        FieldKind::Text => Ok(text(raw)?.map(FieldValue::Text)),
        FieldKind::Integer { min, max } => match integer(raw)? {
            Some(n) if n < min || n > max => {
                Err(format!("value {} is outside {}..={}", n, min, max))
            }
            other => Ok(other.map(FieldValue::Integer)),
        },
        FieldKind::Date => Ok(date(raw)?.map(FieldValue::Text)),
        FieldKind::TextList => Ok(list(raw)?.map(FieldValue::List)),
        FieldKind::TextSet => Ok(list(raw)?.map(|mut items| {
            items.sort();
            items.dedup();
            FieldValue::List(items)
        })),
    }
}

pub fn text(raw: &Value) -> Result<Option<String>, String> {
    match raw {
        Value::Null => Ok(None),
        Value::String(s) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Array(items) if items.is_empty() => Ok(None),
        Value::Array(_) | Value::Object(_) => Err("expected a scalar value".to_string()),
    }
}

fn integer(raw: &Value) -> Result<Option<i64>, String> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Some(i));
            }
            n.as_f64()
                .and_then(integral)
                .map(Some)
                .ok_or_else(|| format!("'{}' is not an integer", n))
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(integral))
                .map(Some)
                .ok_or_else(|| format!("'{}' is not an integer", trimmed))
        }
        other => blank_or(other, "expected an integer"),
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn date(raw: &Value) -> Result<Option<String>, String> {
    let Some(s) = text_only(raw, "expected a date string")? else {
        return Ok(None);
    };
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Ok(Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string()));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(&s, fmt) {
            return Ok(Some(d.format("%Y-%m-%d").to_string()));
        }
    }
    Err(format!("unrecognised date '{}'", s))
}

fn list(raw: &Value) -> Result<Option<Vec<String>>, String> {
    let items: Vec<String> = match raw {
        Value::Array(values) => {
            let mut items = Vec::with_capacity(values.len());
            for value in values {
                if let Some(item) = text(value)? {
                    items.push(item);
                }
            }
            items
        }
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Number(_) | Value::Bool(_) => text(raw)?.into_iter().collect(),
        other => return blank_or(other, "expected a list"),
    };
    Ok((!items.is_empty()).then_some(items))
}

fn text_only(raw: &Value, expected: &str) -> Result<Option<String>, String> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        other => blank_or(other, expected),
    }
}

fn blank_or<T>(raw: &Value, expected: &str) -> Result<Option<T>, String> {
    match raw {
        Value::Null => Ok(None),
        Value::Array(items) if items.is_empty() => Ok(None),
        _ => Err(expected.to_string()),
    }
}
