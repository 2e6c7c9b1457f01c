// Application-facing value tree. This is what target implementations
// receive as arguments and hand back as results; the parser builds these
// from wire expressions and the serializer walks them back out.

use indexmap::IndexMap;
use serde_json::{Number, Value as JsonValue};

use crate::error::RpcError;
use super::hooks::{RpcPromise, Stub};

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    /// Milliseconds since the Unix epoch; distinct from a plain number on
    /// the wire.
    Date(f64),
    Error(RpcError),
    Stub(Stub),
    Promise(RpcPromise),
}

impl Value {
    /// Convert a plain JSON document (no wire tags) into a value.
    pub fn from_plain_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Number(n.clone()),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => {
                Value::Array(items.iter().map(Value::from_plain_json).collect())
            }
            JsonValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_plain_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as plain JSON. Dates flatten to epoch milliseconds;
    /// capabilities and errors have no plain representation and fail with
    /// `bad_request`.
    pub fn to_plain_json(&self) -> Result<JsonValue, RpcError> {
        match self {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Number(n) => Ok(JsonValue::Number(n.clone())),
            Value::String(s) => Ok(JsonValue::String(s.clone())),
            Value::Date(millis) => {
                let n = if millis.fract() == 0.0 && millis.is_finite() {
                    Number::from(*millis as i64)
                } else {
                    Number::from_f64(*millis).unwrap_or_else(|| Number::from(0))
                };
                Ok(JsonValue::Number(n))
            }
            Value::Array(items) => Ok(JsonValue::Array(
                items
                    .iter()
                    .map(Value::to_plain_json)
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Value::Object(map) => {
                let mut obj = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_plain_json()?);
                }
                Ok(JsonValue::Object(obj))
            }
            Value::Error(_) | Value::Stub(_) | Value::Promise(_) => Err(RpcError::bad_request(
                "value has no plain JSON representation",
            )),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Stub(a), Value::Stub(b)) => a.same_capability(b),
            (Value::Promise(a), Value::Promise(b)) => a.same_capability(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
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

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_round_trip() {
        let json = json!({"a": [1, 2, {"b": null}], "c": "text"});
        let value = Value::from_plain_json(&json);
        assert_eq!(value.to_plain_json().unwrap(), json);
    }

    #[test]
    fn dates_flatten_to_millis() {
        assert_eq!(
            Value::Date(1700000000000.0).to_plain_json().unwrap(),
            json!(1700000000000i64)
        );
    }
}
