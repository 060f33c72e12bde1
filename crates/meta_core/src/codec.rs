//! Storage column encoding for structured payloads.
//!
//! Every structured column goes through [`ColumnCodec`] explicitly: the store encodes right
//! before binding a statement value and decodes right after reading a row. Decoding failures
//! are [`MetaError::MalformedValue`], never "absent".

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value as JsonValue};

use crate::{MetaError, MetaResult};

pub type Payload = serde_json::Map<String, JsonValue>;

pub trait ColumnCodec: Sized {
    fn encode(&self) -> MetaResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> MetaResult<Self>;
}

fn encode_json<T: Serialize + ?Sized>(value: &T, shape: &str) -> MetaResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| MetaError::invalid(format!("encode {shape}: {err}")))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], shape: &str) -> MetaResult<T> {
    serde_json::from_slice(bytes).map_err(|err| MetaError::malformed(format!("{shape}: {err}")))
}

/// Ordered tag list; order and duplicates are preserved as given.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(pub Vec<String>);

impl Tags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl ColumnCodec for Tags {
    fn encode(&self) -> MetaResult<Vec<u8>> {
        encode_json(&self.0, "tags")
    }

    fn decode(bytes: &[u8]) -> MetaResult<Self> {
        decode_json(bytes, "tags").map(Tags)
    }
}

/// Named training metrics at 32-bit precision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(pub BTreeMap<String, f32>);

impl Metrics {
    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }
}

impl<const N: usize> From<[(&str, f32); N]> for Metrics {
    fn from(entries: [(&str, f32); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }
}

impl ColumnCodec for Metrics {
    fn encode(&self) -> MetaResult<Vec<u8>> {
        if let Some((name, _)) = self.0.iter().find(|(_, value)| !value.is_finite()) {
            return Err(MetaError::invalid(format!("metric '{name}' is not finite")));
        }
        encode_json(&self.0, "metrics")
    }

    fn decode(bytes: &[u8]) -> MetaResult<Self> {
        decode_json(bytes, "metrics").map(Metrics)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    List,
    Map,
}

/// Structured metadata value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn to_json(&self) -> MetaResult<JsonValue> {
        Ok(match self {
            Value::Null => JsonValue::Null,
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::Number(value) => Number::from_f64(*value)
                .map(JsonValue::Number)
                .ok_or_else(|| MetaError::invalid(format!("number {value} is not finite")))?,
            Value::String(value) => JsonValue::String(value.clone()),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<MetaResult<Vec<_>>>()?,
            ),
            Value::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json()?);
                }
                JsonValue::Object(map)
            }
        })
    }

    pub fn from_json(value: JsonValue) -> MetaResult<Self> {
        Ok(match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(value) => Value::Bool(value),
            JsonValue::Number(number) => Value::Number(
                number
                    .as_f64()
                    .ok_or_else(|| MetaError::malformed(format!("number {number} out of range")))?,
            ),
            JsonValue::String(value) => Value::String(value),
            JsonValue::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<MetaResult<Vec<_>>>()?,
            ),
            JsonValue::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| Value::from_json(value).map(|value| (key, value)))
                    .collect::<MetaResult<BTreeMap<_, _>>>()?,
            ),
        })
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = JsonValue::deserialize(deserializer)?;
        Value::from_json(raw).map_err(serde::de::Error::custom)
    }
}

impl ColumnCodec for Value {
    fn encode(&self) -> MetaResult<Vec<u8>> {
        let json = self.to_json()?;
        encode_json(&json, "value")
    }

    fn decode(bytes: &[u8]) -> MetaResult<Self> {
        let raw: JsonValue = decode_json(bytes, "value")?;
        Value::from_json(raw)
    }
}

impl ColumnCodec for Payload {
    fn encode(&self) -> MetaResult<Vec<u8>> {
        encode_json(self, "payload")
    }

    fn decode(bytes: &[u8]) -> MetaResult<Self> {
        decode_json(bytes, "payload")
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
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

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}
