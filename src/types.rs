//! Common types for neo4j-connect
//!
//! The record envelope consumed from broker topics, the query-event unit
//! handed to the execution engine, and shared helper types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A JSON object, the decoded form of record keys and values
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// A record consumed from a broker topic partition
///
/// `key` and `value` arrive already decoded; the deserialization format
/// (Avro, JSON-Schema, protobuf) is the consumer's concern. A null `value`
/// is a tombstone and signals deletion of the keyed entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRecord {
    /// Topic the record was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Decoded record key
    #[serde(default)]
    pub key: serde_json::Value,
    /// Decoded record value (null = tombstone)
    #[serde(default)]
    pub value: serde_json::Value,
    /// Broker-assigned timestamp
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Record headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SinkRecord {
    /// Create a record with a null key and value
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: serde_json::Value::Null,
            value: serde_json::Value::Null,
            timestamp: None,
            headers: BTreeMap::new(),
        }
    }

    /// Set the key (builder-style)
    pub fn with_key(mut self, key: serde_json::Value) -> Self {
        self.key = key;
        self
    }

    /// Set the value (builder-style)
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = value;
        self
    }

    /// Set the timestamp (builder-style)
    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Add a header (builder-style)
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// A record whose value is null signals deletion of the keyed entity
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }
}

/// A parameterized statement together with the event maps to run it over
///
/// The statement iterates the `$events` parameter; each entry of
/// `parameters` becomes one `event` binding. Within a partition the entries
/// preserve source record offset order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvents {
    /// Parameterized statement text
    pub statement: String,
    /// One entry per translated record, in source order
    pub parameters: Vec<JsonMap>,
}

impl QueryEvents {
    /// Create a query-event group for a statement
    pub fn new(statement: impl Into<String>, parameters: Vec<JsonMap>) -> Self {
        Self {
            statement: statement.into(),
            parameters,
        }
    }

    /// Total number of event entries
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether the group carries no events
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// A wrapper around `SecretString` that provides safe handling of sensitive
/// values.
///
/// Redacts the value in `Debug` and `Display` output, serializes as
/// `"***REDACTED***"`, and exposes the actual value only through
/// [`expose_secret`](SensitiveString::expose_secret).
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use sparingly - only when the actual value is needed (e.g., for
    /// authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Serialize as redacted to prevent accidental exposure in config dumps
impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

/// Deserialize from the actual string value
impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

impl JsonSchema for SensitiveString {
    fn schema_name() -> String {
        "SensitiveString".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
            obj.metadata().description =
                Some("Sensitive value (passwords, API keys). Redacted in logs.".to_string());
        }
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tombstone_detection() {
        let record = SinkRecord::new("users", 0, 42);
        assert!(record.is_tombstone());

        let record = record.with_value(json!({"id": 1}));
        assert!(!record.is_tombstone());
    }

    #[test]
    fn test_record_builder() {
        let record = SinkRecord::new("users", 3, 17)
            .with_key(json!({"id": 1}))
            .with_value(json!({"id": 1, "name": "Alice"}))
            .with_header("source", "crm");

        assert_eq!(record.topic, "users");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 17);
        assert_eq!(record.headers.get("source").map(String::as_str), Some("crm"));
    }

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("hunter2");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_sensitive_string_serde() {
        let secret = SensitiveString::new("hunter2");
        assert_eq!(
            serde_json::to_string(&secret).unwrap(),
            "\"***REDACTED***\""
        );
        let parsed: SensitiveString = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(parsed.expose_secret(), "hunter2");
    }
}
