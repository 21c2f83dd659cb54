//! Property codecs: marshalling between application values and stored values
//!
//! The compiler calls [`PropertyCodec::encode`] before binding a filter
//! operand, the resolver calls [`PropertyCodec::decode`] on every raw field
//! it reads back. Both are pure. `Null` passes through every codec untouched.

use crate::value::Value;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use ulid::Ulid;

/// Failure raised by a codec; the caller attaches the property name
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct CodecError {
    pub message: String,
}

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn expected(kind: &str, got: &Value) -> Self {
        Self::new(format!("expected {}, got {}", kind, got.type_name()))
    }
}

/// Marshalling rule for one property
pub trait PropertyCodec: Send + Sync + Debug {
    /// Name used in diagnostics
    fn kind(&self) -> &'static str;

    /// Application value to stored value
    fn encode(&self, value: &Value) -> Result<Value, CodecError>;

    /// Stored value to application value
    fn decode(&self, stored: &Value) -> Result<Value, CodecError>;

    /// Whether the stored value is a list that filters should search inside
    fn is_array(&self) -> bool {
        false
    }

    /// Value generated when none is supplied
    fn generate(&self) -> Option<Value> {
        None
    }
}

/// UTF-8 strings, optionally length-limited
#[derive(Debug, Clone, Default)]
pub struct StringCodec {
    pub max_length: Option<usize>,
}

impl StringCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

impl PropertyCodec for StringCodec {
    fn kind(&self) -> &'static str {
        "string"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::String(s) => {
                if let Some(max) = self.max_length {
                    let len = s.chars().count();
                    if len > max {
                        return Err(CodecError::new(format!(
                            "string of {} chars exceeds max length {}",
                            len, max
                        )));
                    }
                }
                Ok(value.clone())
            }
            other => Err(CodecError::expected("string", other)),
        }
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        match stored {
            Value::Null | Value::String(_) => Ok(stored.clone()),
            other => Err(CodecError::expected("string", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCodec;

impl PropertyCodec for IntegerCodec {
    fn kind(&self) -> &'static str {
        "integer"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null | Value::Integer(_) => Ok(value.clone()),
            Value::Float(f) if f.fract() == 0.0 => Ok(Value::Integer(*f as i64)),
            other => Err(CodecError::expected("integer", other)),
        }
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        self.encode(stored)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FloatCodec;

impl PropertyCodec for FloatCodec {
    fn kind(&self) -> &'static str {
        "float"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null => Ok(Value::Null),
            other => other
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| CodecError::expected("number", other)),
        }
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        self.encode(stored)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanCodec;

impl PropertyCodec for BooleanCodec {
    fn kind(&self) -> &'static str {
        "boolean"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Null | Value::Bool(_) => Ok(value.clone()),
            other => Err(CodecError::expected("bool", other)),
        }
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        self.encode(stored)
    }
}

/// UTC timestamps
///
/// Accepts RFC 3339 strings or epoch seconds; stores epoch seconds as a
/// float and decodes back to an RFC 3339 string.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTimeCodec;

impl DateTimeCodec {
    pub fn to_datetime(value: &Value) -> Result<DateTime<Utc>, CodecError> {
        match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| CodecError::new(format!("invalid timestamp {:?}: {}", s, e))),
            other => {
                let seconds = other
                    .as_f64()
                    .ok_or_else(|| CodecError::expected("timestamp", other))?;
                let millis = (seconds * 1000.0).round() as i64;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| CodecError::new(format!("timestamp {} out of range", seconds)))
            }
        }
    }
}

impl PropertyCodec for DateTimeCodec {
    fn kind(&self) -> &'static str {
        "datetime"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let dt = Self::to_datetime(value)?;
        Ok(Value::Float(dt.timestamp_millis() as f64 / 1000.0))
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        if stored.is_null() {
            return Ok(Value::Null);
        }
        let dt = Self::to_datetime(stored)?;
        Ok(Value::String(dt.to_rfc3339()))
    }
}

/// Homogeneous lists; each element goes through the inner codec
#[derive(Debug, Clone)]
pub struct ArrayCodec {
    inner: Arc<dyn PropertyCodec>,
}

impl ArrayCodec {
    pub fn of(inner: impl PropertyCodec + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn map_items(
        &self,
        value: &Value,
        f: impl Fn(&dyn PropertyCodec, &Value) -> Result<Value, CodecError>,
    ) -> Result<Value, CodecError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::List(items) => items
                .iter()
                .map(|item| f(self.inner.as_ref(), item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            other => Err(CodecError::expected("list", other)),
        }
    }
}

impl PropertyCodec for ArrayCodec {
    fn kind(&self) -> &'static str {
        "array"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        self.map_items(value, |codec, item| codec.encode(item))
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        self.map_items(stored, |codec, item| codec.decode(item))
    }

    fn is_array(&self) -> bool {
        true
    }
}

/// Arbitrary values stored as a JSON string
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PropertyCodec for JsonCodec {
    fn kind(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        serde_json::to_string(value)
            .map(Value::String)
            .map_err(|e| CodecError::new(e.to_string()))
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        match stored {
            Value::Null => Ok(Value::Null),
            Value::String(s) => serde_json::from_str(s).map_err(|e| CodecError::new(e.to_string())),
            other => Err(CodecError::expected("json string", other)),
        }
    }
}

/// String identifiers, generated as ULIDs when not supplied
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueIdCodec;

impl PropertyCodec for UniqueIdCodec {
    fn kind(&self) -> &'static str {
        "unique_id"
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        StringCodec::new().encode(value)
    }

    fn decode(&self, stored: &Value) -> Result<Value, CodecError> {
        StringCodec::new().decode(stored)
    }

    fn generate(&self) -> Option<Value> {
        Some(Value::String(Ulid::new().to_string().to_lowercase()))
    }
}
