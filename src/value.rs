//! Portable, JSON-like value model bus values are unwrapped into and
//! wrapped back from.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// The value shapes a bus read can unwrap to: null, bool, int, float,
/// string, base64-encoded bytes, array, or map of string to value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(std::collections::BTreeMap<String, Value>),
}

impl Value {
    /// Builds a value from raw bytes, matching the base64-encoding
    /// requirement for byte arrays.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Decodes a string value as base64 bytes, if it is one.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::String(s) => base64::engine::general_purpose::STANDARD.decode(s).ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => {
                Json::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                Value::Map(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_through_base64() {
        let bytes = vec![0u8, 1, 2, 255, 254];
        let value = Value::from_bytes(&bytes);
        assert_eq!(value.as_bytes().unwrap(), bytes);
    }

    #[test]
    fn unwrap_wrap_round_trips_primitives() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::String("hi".into()),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        ] {
            let json = value.to_json();
            assert_eq!(Value::from_json(&json), value);
        }
    }

    #[test]
    fn map_round_trips() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        let value = Value::Map(map);
        let json = value.to_json();
        assert_eq!(Value::from_json(&json), value);
    }
}
