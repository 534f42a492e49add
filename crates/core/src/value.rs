//! Declared field types and the central coercion table.
//!
//! Values are carried as `serde_json::Value` end to end (that is also what the
//! document store speaks). Coercion normalizes a raw value into the declared
//! type's canonical JSON shape, or reports absence when it cannot.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Type of a declared scalar field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 UTC timestamp.
    Timestamp,
    /// Reference to another entity's identifier (foreign keys).
    Identifier,
    /// Any JSON value, stored as-is.
    Json,
}

/// Per-type value coercion.
pub trait FieldCoercer {
    /// Coerce `raw` into `ty`. `None` means the value cannot represent `ty`.
    ///
    /// `null` coerces to `null` for every type.
    fn coerce(&self, ty: FieldType, raw: &JsonValue) -> Option<JsonValue>;
}

type CoerceFn = fn(&JsonValue) -> Option<JsonValue>;

/// Coercion through a single table keyed by [`FieldType`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCoercer;

impl DefaultCoercer {
    fn table(ty: FieldType) -> CoerceFn {
        match ty {
            FieldType::String => coerce_string,
            FieldType::Integer => coerce_integer,
            FieldType::Float => coerce_float,
            FieldType::Boolean => coerce_boolean,
            FieldType::Timestamp => coerce_timestamp,
            FieldType::Identifier => coerce_identifier,
            FieldType::Json => |v| Some(v.clone()),
        }
    }
}

impl FieldCoercer for DefaultCoercer {
    fn coerce(&self, ty: FieldType, raw: &JsonValue) -> Option<JsonValue> {
        if raw.is_null() {
            return Some(JsonValue::Null);
        }
        Self::table(ty)(raw)
    }
}

fn coerce_string(raw: &JsonValue) -> Option<JsonValue> {
    match raw {
        JsonValue::String(_) => Some(raw.clone()),
        JsonValue::Number(n) => Some(JsonValue::String(n.to_string())),
        JsonValue::Bool(b) => Some(JsonValue::String(b.to_string())),
        _ => None,
    }
}

fn coerce_integer(raw: &JsonValue) -> Option<JsonValue> {
    match raw {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(JsonValue::from(i));
            }
            let f = n.as_f64()?;
            (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64)
                .then(|| JsonValue::from(f as i64))
        }
        JsonValue::String(s) => s.trim().parse::<i64>().ok().map(JsonValue::from),
        JsonValue::Bool(b) => Some(JsonValue::from(i64::from(*b))),
        _ => None,
    }
}

fn coerce_float(raw: &JsonValue) -> Option<JsonValue> {
    let f = match raw {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    serde_json::Number::from_f64(f).map(JsonValue::Number)
}

fn coerce_boolean(raw: &JsonValue) -> Option<JsonValue> {
    match raw {
        JsonValue::Bool(_) => Some(raw.clone()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Some(JsonValue::Bool(false)),
            Some(1) => Some(JsonValue::Bool(true)),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(JsonValue::Bool(true)),
            "false" | "0" | "no" => Some(JsonValue::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_timestamp(raw: &JsonValue) -> Option<JsonValue> {
    let ts: DateTime<Utc> = match raw {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()?
            .with_timezone(&Utc),
        // Integers are seconds since the Unix epoch.
        JsonValue::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0)?,
        _ => return None,
    };
    Some(JsonValue::String(
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    ))
}

fn coerce_identifier(raw: &JsonValue) -> Option<JsonValue> {
    match raw {
        JsonValue::String(s) if !s.is_empty() => Some(raw.clone()),
        JsonValue::Number(n) => Some(JsonValue::String(n.to_string())),
        _ => None,
    }
}
