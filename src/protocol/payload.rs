//! JSON envelope carried by application and control messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Timestamped metrics with an optional opaque body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl Default for CloudPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudPayload {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_metric(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn add_metric(&mut self, name: &str, value: impl Into<Value>) {
        self.metrics.insert(name.to_string(), value.into());
    }

    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.metrics.get(name)
    }

    /// String metric; other JSON types are rendered as text
    pub fn metric_str(&self, name: &str) -> Option<String> {
        match self.metrics.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Maps with string keys and plain values always serialize
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode an envelope; anything else becomes the body of an empty envelope
    pub fn decode(raw: &[u8]) -> Self {
        serde_json::from_slice(raw).unwrap_or_else(|_| Self::new().with_body(raw.to_vec()))
    }
}
