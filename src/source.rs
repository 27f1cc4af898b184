//! Source connector substrate
//!
//! The opposing direction of the bridge: a parameterized query polled
//! against the graph, with each returned row published as a topic record.
//! This module owns the configuration, the statement construction and the
//! record envelope; the polling loop, cursor persistence and the producer
//! itself live with the embedding broker client.

use crate::error::{ConnectError, Result};
use crate::types::JsonMap;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Name of the cursor parameter polling queries must reference
pub const CURSOR_PARAMETER: &str = "lastCheck";

/// Where the first poll starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamFrom {
    /// Only changes after connector start
    #[default]
    Now,
    /// Everything the query can see
    All,
}

/// Source connector configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SourceConnectorConfig {
    /// Topic the records are published to
    #[validate(length(min = 1))]
    pub topic: String,

    /// Polling query; must reference `$lastCheck`
    #[validate(length(min = 1))]
    pub query: String,

    /// Poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Cursor starting point
    #[serde(default)]
    pub stream_from: StreamFrom,
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

impl SourceConnectorConfig {
    /// Validate beyond field-level checks
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ConnectError::config(e.to_string()))?;
        if !self.query.contains(&format!("${CURSOR_PARAMETER}")) {
            return Err(ConnectError::config(format!(
                "source query must reference ${CURSOR_PARAMETER}"
            )));
        }
        Ok(())
    }

    /// The statement handed to the driver on every poll
    pub fn polling_statement(&self) -> &str {
        self.query.trim()
    }

    /// Cursor value for the first poll (epoch millis)
    pub fn initial_cursor(&self, now: DateTime<Utc>) -> i64 {
        match self.stream_from {
            StreamFrom::Now => now.timestamp_millis(),
            StreamFrom::All => -1,
        }
    }
}

/// A record the source publishes to its topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Destination topic
    pub topic: String,
    /// Record key (absent for keyless rows)
    #[serde(default)]
    pub key: Option<serde_json::Value>,
    /// Row projected by the polling query
    pub value: serde_json::Value,
    /// When the row was observed
    pub timestamp: DateTime<Utc>,
}

impl SourceRecord {
    /// Envelope one queried row.
    ///
    /// A row field named `id` becomes the record key so partitioning keeps
    /// per-entity ordering downstream.
    pub fn from_row(topic: impl Into<String>, row: JsonMap, observed_at: DateTime<Utc>) -> Self {
        let key = row.get("id").cloned();
        Self {
            topic: topic.into(),
            key,
            value: serde_json::Value::Object(row),
            timestamp: observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(query: &str) -> SourceConnectorConfig {
        SourceConnectorConfig {
            topic: "graph.out".to_string(),
            query: query.to_string(),
            poll_interval_ms: 1000,
            stream_from: StreamFrom::Now,
        }
    }

    #[test]
    fn test_query_must_reference_cursor() {
        let valid = config("MATCH (n) WHERE n.updatedAt > $lastCheck RETURN n.id AS id");
        valid.validate_config().unwrap();

        let invalid = config("MATCH (n) RETURN n");
        assert!(invalid.validate_config().is_err());
    }

    #[test]
    fn test_initial_cursor() {
        let now = Utc::now();
        let mut config = config("RETURN $lastCheck");
        assert_eq!(config.initial_cursor(now), now.timestamp_millis());

        config.stream_from = StreamFrom::All;
        assert_eq!(config.initial_cursor(now), -1);
    }

    #[test]
    fn test_record_key_from_id_field() {
        let row = json!({"id": 7, "name": "x"}).as_object().unwrap().clone();
        let record = SourceRecord::from_row("graph.out", row, Utc::now());
        assert_eq!(record.key, Some(json!(7)));
        assert_eq!(record.value["name"], json!("x"));
    }
}
