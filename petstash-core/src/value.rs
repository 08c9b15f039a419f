/*!
Metadata values.

Entity metadata is an open key/value mapping whose values are scalars or
nested lists/maps. The store keeps every value as text; [`MetaValue::from_stored`]
is the single decode point and [`MetaValue::to_stored`] its inverse.
*/

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Metadata mapping as carried in a snapshot entry.
pub type Meta = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    /// Decode a stored text value once.
    ///
    /// JSON lists, maps and the literals `true`/`false` are decoded; any other
    /// text, including numeric text, stays a string.
    pub fn from_stored(raw: &str) -> Self {
        let trimmed = raw.trim();
        let looks_serialized = trimmed.starts_with('[')
            || trimmed.starts_with('{')
            || trimmed == "true"
            || trimmed == "false";

        if looks_serialized {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if let Some(decoded) = Self::from_json(value) {
                    return decoded;
                }
            }
        }
        MetaValue::String(raw.to_string())
    }

    /// Text representation written to the store.
    pub fn to_stored(&self) -> String {
        match self {
            MetaValue::String(s) => s.clone(),
            MetaValue::Number(n) => n.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    /// Convert an arbitrary JSON value. `null` has no metadata representation.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(MetaValue::Bool(b)),
            Value::Number(n) => Some(MetaValue::Number(n)),
            Value::String(s) => Some(MetaValue::String(s)),
            Value::Array(items) => Some(MetaValue::List(
                items.into_iter().filter_map(Self::from_json).collect(),
            )),
            Value::Object(map) => Some(MetaValue::Map(
                map.into_iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|v| (k, v)))
                    .collect(),
            )),
        }
    }

    /// Interpret the value as an entity or attachment id.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            MetaValue::Number(n) => n.as_i64(),
            MetaValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Same representation as `self`, carrying a different id.
    pub fn with_id(&self, id: i64) -> Self {
        match self {
            MetaValue::Number(_) => MetaValue::Number(id.into()),
            _ => MetaValue::String(id.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Deserialize a metadata mapping, tolerating `null` values by dropping them.
pub(crate) fn deserialize_meta<'de, D>(deserializer: D) -> Result<Meta, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| MetaValue::from_json(v).map(|v| (k, v)))
        .collect())
}
