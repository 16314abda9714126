// src/publish/event.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field name → value mapping carried by an [`Event`].
pub type Fields = BTreeMap<String, FieldValue>;

/// One record bound for the collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sourcetype: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(rename = "event")]
    pub fields: Fields,
}

impl Event {
    pub fn with_fields(fields: Fields) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }
}

/// A field value. Column values are always strings; raw JSON can nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<FieldValue>),
    Map(Fields),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => FieldValue::Number(n),
            Value::String(s) => FieldValue::String(s),
            Value::Array(items) => FieldValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => FieldValue::Map(fields_from_json(map)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n.into())
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

pub fn fields_from_json(map: serde_json::Map<String, Value>) -> Fields {
    map.into_iter().map(|(k, v)| (k, v.into())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_metadata_is_left_out_of_the_wire_form() {
        let mut fields = Fields::new();
        fields.insert("msg".into(), "hi".into());
        let event = Event {
            time: Some(10),
            sourcetype: "syslog".into(),
            ..Event::with_fields(fields)
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(
            wire,
            json!({"time": 10, "sourcetype": "syslog", "event": {"msg": "hi"}})
        );
    }

    #[test]
    fn nested_json_converts_without_loss() {
        let raw = json!({
            "a": 1.5,
            "b": [{"c": null}, "d", true],
            "e": {"f": -3}
        });
        let value = FieldValue::from(raw.clone());
        assert_eq!(serde_json::to_value(&value).unwrap(), raw);

        let back: FieldValue = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(back, value);
    }
}
