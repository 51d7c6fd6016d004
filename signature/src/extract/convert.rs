//! Conversion of raw field spans into typed JSON values.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use super::markdown::parse_markdown_list;
use crate::error::ExtractionError;
use crate::field::{Field, FieldKind};

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```([A-Za-z]+)?\s*([\s\S]*?)\s*```").expect("valid regex"));

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://[^\s/?#]+\S*$").expect("valid regex"));

/// Field patterns compiled on first use.
static PATTERNS: LazyLock<Mutex<HashMap<String, Regex>>> = LazyLock::new(Mutex::default);

fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut cache = PATTERNS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(regex) = cache.get(pattern) {
        return Ok(regex.clone());
    }
    let regex = Regex::new(pattern)?;
    cache.insert(pattern.to_string(), regex.clone());
    Ok(regex)
}

const ABSENT_LITERALS: [&str; 3] = ["null", "NULL", "undefined"];

/// Whether trimmed text counts as "no value".
pub(crate) fn is_absent(trimmed: &str) -> bool {
    trimmed.is_empty() || ABSENT_LITERALS.contains(&trimmed)
}

/// Whether trimmed text could still grow into an absent literal.
pub(crate) fn may_become_absent(trimmed: &str) -> bool {
    trimmed.is_empty() || ABSENT_LITERALS.iter().any(|l| l.starts_with(trimmed))
}

/// Returns the body of the first fenced code block, or the input unchanged.
pub(crate) fn extract_block(input: &str) -> &str {
    FENCED_BLOCK
        .captures(input)
        .and_then(|c| c.get(2))
        .map_or(input, |m| m.as_str())
}

/// Converts a field's raw span.
///
/// Returns `Ok(None)` for an absent optional value.
pub(crate) fn parse_field_value(field: &Field, raw: &str) -> Result<Option<Value>, ExtractionError> {
    let text = raw.trim();

    if is_absent(text) {
        if field.is_optional {
            return Ok(None);
        }
        return Err(ExtractionError::MissingValue {
            field: field.name.clone(),
        });
    }

    if field.field_type.is_array {
        return parse_array(field, text).map(Some);
    }

    if field.field_type.kind == FieldKind::Json {
        return parse_json(field, extract_block(text)).map(Some);
    }

    convert_scalar(field, text).map(Some)
}

fn parse_json(field: &Field, text: &str) -> Result<Value, ExtractionError> {
    serde_json::from_str(text.trim()).map_err(|e| ExtractionError::InvalidJson {
        field: field.name.clone(),
        message: e.to_string(),
        raw: text.to_string(),
    })
}

fn parse_array(field: &Field, text: &str) -> Result<Value, ExtractionError> {
    let invalid = |message: String| ExtractionError::InvalidArray {
        field: field.name.clone(),
        message,
        raw: text.to_string(),
    };

    let items: Vec<Value> = match serde_json::from_str::<Value>(extract_block(text)) {
        Ok(Value::Array(items)) => items,
        Ok(_) => return Err(invalid("Expected an array".to_string())),
        Err(_) => parse_markdown_list(text)
            .map_err(invalid)?
            .into_iter()
            .map(Value::String)
            .collect(),
    };

    items
        .into_iter()
        .map(|item| convert_item(field, item))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn convert_item(field: &Field, item: Value) -> Result<Value, ExtractionError> {
    let kind = field.field_type.kind;
    match (kind, item) {
        (FieldKind::Json, item) => Ok(item),
        (FieldKind::Number, Value::Number(n)) => {
            check_number_bounds(field, n.as_f64().unwrap_or_default())?;
            Ok(Value::Number(n))
        }
        (FieldKind::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (_, Value::String(s)) => convert_scalar(field, s.trim()),
        (_, other) => Err(ExtractionError::InvalidValue {
            field: field.name.clone(),
            expected: kind.describe().to_string(),
            raw: other.to_string(),
        }),
    }
}

fn invalid_value(field: &Field, raw: &str) -> ExtractionError {
    ExtractionError::InvalidValue {
        field: field.name.clone(),
        expected: field.field_type.kind.describe().to_string(),
        raw: raw.to_string(),
    }
}

/// Converts one scalar according to the field's kind and checks constraints.
pub(crate) fn convert_scalar(field: &Field, text: &str) -> Result<Value, ExtractionError> {
    match field.field_type.kind {
        FieldKind::String => {
            check_string_constraints(field, text)?;
            Ok(Value::String(text.to_string()))
        }
        FieldKind::Number => {
            let number = parse_number(text).ok_or_else(|| invalid_value(field, text))?;
            check_number_bounds(field, number.as_f64().unwrap_or_default())?;
            Ok(Value::Number(number))
        }
        FieldKind::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid_value(field, text)),
        },
        FieldKind::Json => parse_json(field, extract_block(text)),
        FieldKind::Code => Ok(Value::String(extract_block(text).to_string())),
        FieldKind::Url => {
            if URL.is_match(text) {
                Ok(Value::String(text.to_string()))
            } else {
                Err(invalid_value(field, text))
            }
        }
        FieldKind::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .map_err(|_| invalid_value(field, text)),
        FieldKind::DateTime => parse_datetime(text)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .ok_or_else(|| invalid_value(field, text)),
        FieldKind::Class => {
            let options = &field.field_type.constraints.options;
            if options.iter().any(|o| o == text) {
                Ok(Value::String(text.to_string()))
            } else {
                Err(ExtractionError::InvalidClass {
                    field: field.name.clone(),
                    raw: text.to_string(),
                    options: options.clone(),
                })
            }
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Number::from(n));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S %:z", "%Y-%m-%d %H:%M %:z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = text
        .strip_suffix(" UTC")
        .or_else(|| text.strip_suffix(" GMT"))
        .or_else(|| text.strip_suffix('Z'))
        .unwrap_or(text)
        .trim();
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|dt| dt.and_utc())
}

fn check_string_constraints(field: &Field, text: &str) -> Result<(), ExtractionError> {
    let constraints = &field.field_type.constraints;
    let violation = |message: String| ExtractionError::ConstraintViolation {
        field: field.name.clone(),
        message,
    };
    let len = text.chars().count();

    if let Some(min) = constraints.min_length.filter(|min| len < *min) {
        return Err(violation(format!("must be at least {min} characters long")));
    }
    if let Some(max) = constraints.max_length.filter(|max| len > *max) {
        return Err(violation(format!("must be at most {max} characters long")));
    }
    if let Some(pattern) = &constraints.pattern {
        let matches = compiled_pattern(pattern)
            .map_err(|e| violation(format!("has an invalid pattern: {e}")))?
            .is_match(text);
        if !matches {
            return Err(violation(format!("must match pattern '{pattern}'")));
        }
    }
    Ok(())
}

fn check_number_bounds(field: &Field, value: f64) -> Result<(), ExtractionError> {
    let constraints = &field.field_type.constraints;
    let violation = |message: String| ExtractionError::ConstraintViolation {
        field: field.name.clone(),
        message,
    };

    if let Some(min) = constraints.minimum.filter(|min| value < *min) {
        return Err(violation(format!("must be at least {min}")));
    }
    if let Some(max) = constraints.maximum.filter(|max| value > *max) {
        return Err(violation(format!("must be at most {max}")));
    }
    Ok(())
}
