//! Dead-letter routing
//!
//! Records the pipeline refuses can be published to a secondary topic for
//! later inspection. The producer itself belongs to the embedding broker
//! client; the runner only needs the publishing capability and the record
//! envelope carrying enough context to trace the refusal.

use crate::error::ConnectError;
use crate::types::SinkRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// A refused record, enveloped for the dead-letter topic
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    /// Topic the refused record came from
    pub source_topic: String,
    /// Partition within the source topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Original record key
    pub key: serde_json::Value,
    /// Original record value
    pub value: serde_json::Value,
    /// Headers describing the refusal
    pub headers: BTreeMap<String, String>,
}

impl DeadLetterRecord {
    /// Envelope a refused record with error headers
    pub fn new(record: &SinkRecord, error_kind: &str, message: &str) -> Self {
        let mut headers = record.headers.clone();
        headers.insert("__connect.errors.kind".to_string(), error_kind.to_string());
        headers.insert("__connect.errors.message".to_string(), message.to_string());
        Self {
            source_topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            value: record.value.clone(),
            headers,
        }
    }
}

/// Capability to publish refused records
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish one refused record to the given topic
    async fn publish(
        &self,
        topic: &str,
        record: DeadLetterRecord,
    ) -> std::result::Result<(), ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_carries_error_headers() {
        let record = SinkRecord::new("orders", 2, 99)
            .with_value(json!({"bad": true}))
            .with_header("trace", "abc");

        let dead = DeadLetterRecord::new(&record, "malformed_record", "not a CUD record");
        assert_eq!(dead.source_topic, "orders");
        assert_eq!(dead.partition, 2);
        assert_eq!(dead.offset, 99);
        assert_eq!(
            dead.headers.get("__connect.errors.kind").map(String::as_str),
            Some("malformed_record")
        );
        assert_eq!(dead.headers.get("trace").map(String::as_str), Some("abc"));
    }
}
