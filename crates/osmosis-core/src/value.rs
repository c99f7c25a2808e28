//! Values and records: the payload model shared by items and stored rows.
//!
//! A `Value` is JSON-like and self-describing, so it survives any of the
//! worker codecs unchanged. A `Record` is a flat, ordered bag of named values
//! (one source row, or one normalized output row).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A JSON-like value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Record> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Render a scalar as a record key.
    ///
    /// Strings are used as-is and integers in decimal. Everything else
    /// (including empty strings) has no key form.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether this value holds a NaN or infinite float anywhere.
    pub fn has_non_finite(&self) -> bool {
        match self {
            Value::Float(n) => !n.is_finite(),
            Value::Array(arr) => arr.iter().any(Value::has_non_finite),
            Value::Object(obj) => obj.values().any(Value::has_non_finite),
            _ => false,
        }
    }

    /// Compact JSON rendering, used for the store's JSON columns.
    ///
    /// JSON has no NaN or infinity; such floats are written as null.
    pub fn to_json(&self) -> String {
        if self.has_non_finite() {
            warn!("non-finite float has no JSON form; storing it as null");
        }
        match serde_json::to_string(self) {
            Ok(text) => text,
            Err(e) => {
                warn!("value could not be rendered as JSON, storing null: {e}");
                "null".to_string()
            }
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(arr: Vec<T>) -> Self {
        Value::Array(arr.into_iter().map(Into::into).collect())
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record)
    }
}

/// A flat, ordered bag of named values.
pub type Record = IndexMap<String, Value>;

/// Extension trait for building records ergonomically.
pub trait RecordExt {
    fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self;
}

impl RecordExt for Record {
    fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i64), Value::Int(42));
        assert_eq!(Value::from(3.15f64), Value::Float(3.15));
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
    }

    #[test]
    fn test_record_builder() {
        let record = Record::new()
            .with("username", "alice")
            .with("id", 1024i64)
            .with("admin", false);

        assert_eq!(record.get("username").and_then(Value::as_str), Some("alice"));
        assert_eq!(record.get("id").and_then(Value::as_i64), Some(1024));
        // Insertion order is preserved.
        let keys: Vec<_> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["username", "id", "admin"]);
    }

    #[test]
    fn test_as_key() {
        assert_eq!(Value::from("u-7").as_key(), Some("u-7".to_string()));
        assert_eq!(Value::from(7i64).as_key(), Some("7".to_string()));
        assert_eq!(Value::from("").as_key(), None);
        assert_eq!(Value::Float(1.5).as_key(), None);
        assert_eq!(Value::Null.as_key(), None);
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        let value = Value::from(
            Record::new()
                .with("ratio", f64::NAN)
                .with("scores", vec![1.5, f64::INFINITY]),
        );
        assert!(value.has_non_finite());
        assert_eq!(value.to_json(), r#"{"ratio":null,"scores":[1.5,null]}"#);
        assert!(!Value::from(vec![1.5, 2.0]).has_non_finite());
    }

    #[test]
    fn test_json_text() {
        let value = Value::from(Record::new().with("id", 1i64).with("name", "bob"));
        let text = value.to_json();
        assert_eq!(text, r#"{"id":1,"name":"bob"}"#);
        assert_eq!(Value::from_json(&text).unwrap(), value);
    }
}
