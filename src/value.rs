//! Values produced by user code and their wire serialization.

use crate::protocol::TypedData;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A structured result whose named fields can be projected onto output
/// bindings.
pub trait OutputObject: fmt::Debug + Send + Sync {
    /// Read a field by name. `None` when the object has no such field.
    fn field(&self, name: &str) -> Option<Value>;

    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
}

/// A value returned from a function or written to an output binding.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Bytes(Vec<u8>),
    Int(i64),
    Double(f64),
    Bool(bool),
    Json(serde_json::Value),
    Object(Arc<dyn OutputObject>),
}

impl Value {
    /// Serialize any `T` into a JSON value.
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Value::Json(serde_json::to_value(value)?))
    }

    pub fn object(obj: impl OutputObject + 'static) -> Self {
        Value::Object(Arc::new(obj))
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Json(v) => v.is_null(),
            _ => false,
        }
    }

    /// Named field of a structured value. Scalars have no fields.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            Value::Object(obj) => obj.field(name),
            Value::Json(serde_json::Value::Object(map)) => map.get(name).cloned().map(Value::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::to_value(b)?,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Double(d) => serde_json::Value::from(*d),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Json(v) => v.clone(),
            Value::Object(obj) => obj.to_json()?,
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                Arc::ptr_eq(a, b) || matches!((a.to_json(), b.to_json()), (Ok(x), Ok(y)) if x == y)
            }
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// An ordered bag of named fields. The simplest [`OutputObject`].
///
/// ```
/// use funcworker::value::{Record, Value};
///
/// let reply = Record::new()
///     .with("body", "created")
///     .with("queue_message", Value::Int(42));
/// assert_eq!(Value::object(reply).field("body"), Some(Value::from("created")));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl OutputObject for Record {
    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json()?);
        }
        Ok(serde_json::Value::Object(map))
    }
}

/// Turns a [`Value`] into its wire form. `Ok(None)` means "no payload".
pub trait Serializer: fmt::Debug + Send + Sync {
    fn serialize(&self, value: &Value) -> serde_json::Result<Option<TypedData>>;
}

/// Default serializer: scalars map to their native wire shape, structured
/// values become JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> serde_json::Result<Option<TypedData>> {
        Ok(match value {
            Value::Null => None,
            Value::String(s) => Some(TypedData::String(s.clone())),
            Value::Bytes(b) => Some(TypedData::Bytes(b.clone())),
            Value::Int(i) => Some(TypedData::Int(*i)),
            Value::Double(d) => Some(TypedData::Double(*d)),
            Value::Bool(b) => Some(TypedData::Json(b.to_string())),
            Value::Json(serde_json::Value::Null) => None,
            Value::Json(v) => Some(TypedData::Json(serde_json::to_string(v)?)),
            Value::Object(obj) => Some(TypedData::Json(serde_json::to_string(&obj.to_json()?)?)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_objects_expose_fields() {
        let v = Value::Json(json!({"name": "widget", "count": 3}));
        assert_eq!(v.field("name"), Some(Value::Json(json!("widget"))));
        assert_eq!(v.field("missing"), None);
        assert_eq!(Value::from("scalar").field("name"), None);
    }

    #[test]
    fn json_null_counts_as_null() {
        assert!(Value::Json(serde_json::Value::Null).is_null());
        assert!(!Value::Int(0).is_null());
    }

    #[test]
    fn serializer_keeps_scalars_native() {
        let s = JsonSerializer;
        assert_eq!(s.serialize(&Value::from("hi")).unwrap(), Some(TypedData::String("hi".into())));
        assert_eq!(s.serialize(&Value::Int(7)).unwrap(), Some(TypedData::Int(7)));
        assert_eq!(s.serialize(&Value::Null).unwrap(), None);
    }

    #[test]
    fn serializer_writes_objects_as_json_text() {
        let rec = Record::new().with("a", 1i64).with("b", "two");
        let data = JsonSerializer.serialize(&Value::object(rec)).unwrap();
        match data {
            Some(TypedData::Json(text)) => {
                let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed, json!({"a": 1, "b": "two"}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
