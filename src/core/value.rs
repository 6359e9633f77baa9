//! Layer 3: Snapshot values
//!
//! Snapshots are heterogeneous JSON modeled as a tagged-variant tree.
//! Cross-object references are a distinguished variant rather than a
//! string convention, so ref traversal never guesses.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use thiserror::Error;

use super::oid::{Oid, OidError};

/// Marker field for the wire encoding of refs: `{"@@type":"ref","id":…}`.
const REF_TYPE_KEY: &str = "@@type";
const REF_ID_KEY: &str = "id";

/// A snapshot value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Reference to another object by OID.
    Ref(Oid),
}

impl Value {
    pub fn object() -> Value {
        Value::Object(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(field))
    }

    /// Collect every OID referenced anywhere in this value.
    pub fn collect_refs(&self, out: &mut Vec<Oid>) {
        match self {
            Value::Ref(oid) => out.push(oid.clone()),
            Value::Array(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    item.collect_refs(out);
                }
            }
            _ => {}
        }
    }

    /// Convert to the JSON wire form (refs become tagged objects).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Ref(oid) => serde_json::json!({
                REF_TYPE_KEY: "ref",
                REF_ID_KEY: oid.as_str(),
            }),
        }
    }

    /// Parse the JSON wire form. An object carrying `"@@type": "ref"` is
    /// decoded as a reference; its `id` must be a valid OID.
    pub fn from_json(json: &serde_json::Value) -> Result<Value, ValueError> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                if map.get(REF_TYPE_KEY).and_then(|v| v.as_str()) == Some("ref") {
                    let raw = map
                        .get(REF_ID_KEY)
                        .and_then(|v| v.as_str())
                        .ok_or(ValueError::RefMissingId)?;
                    Value::Ref(Oid::parse(raw)?)
                } else {
                    Value::Object(
                        map.iter()
                            .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                            .collect::<Result<_, ValueError>>()?,
                    )
                }
            }
        })
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&json).map_err(D::Error::custom)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("ref object missing string \"id\"")]
    RefMissingId,
    #[error(transparent)]
    Oid(#[from] OidError),
}
