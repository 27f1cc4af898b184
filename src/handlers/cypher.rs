//! Cypher template strategy
//!
//! Runs a user-provided statement template once per record. The template is
//! wrapped in the shared `UNWIND $events AS event` prelude and sees each
//! record as an `event` map carrying the bindings enabled in the
//! configuration.

use super::{SinkHandler, Translation};
use crate::query::EVENT_PRELUDE;
use crate::types::{JsonMap, QueryEvents, SinkRecord};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which record fields the template can reference
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CypherBindings {
    /// Bind the record key as `event.key`
    #[serde(default)]
    pub bind_key: bool,
    /// Bind the record value as `event.value`
    #[serde(default = "default_true")]
    pub bind_value: bool,
    /// Bind the record headers as `event.header`
    #[serde(default)]
    pub bind_header: bool,
    /// Bind the record timestamp as `event.timestamp`
    #[serde(default)]
    pub bind_timestamp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CypherBindings {
    fn default() -> Self {
        Self {
            bind_key: false,
            bind_value: true,
            bind_header: false,
            bind_timestamp: false,
        }
    }
}

/// Handler running a user statement template per record
pub struct CypherHandler {
    statement: String,
    bindings: CypherBindings,
}

impl CypherHandler {
    /// Wrap the user template in the iteration prelude
    pub fn new(template: impl Into<String>, bindings: CypherBindings) -> Self {
        Self {
            statement: format!("{EVENT_PRELUDE} {}", template.into().trim()),
            bindings,
        }
    }

    fn event_for(&self, record: &SinkRecord) -> JsonMap {
        let mut event = JsonMap::new();
        if self.bindings.bind_key {
            event.insert("key".to_string(), record.key.clone());
        }
        if self.bindings.bind_value {
            event.insert("value".to_string(), record.value.clone());
        }
        if self.bindings.bind_header {
            let headers: JsonMap = record
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            event.insert("header".to_string(), serde_json::Value::Object(headers));
        }
        if self.bindings.bind_timestamp {
            let ts = record
                .timestamp
                .map(|t| serde_json::Value::from(t.timestamp_millis()))
                .unwrap_or(serde_json::Value::Null);
            event.insert("timestamp".to_string(), ts);
        }
        event
    }
}

impl SinkHandler for CypherHandler {
    fn strategy(&self) -> &'static str {
        "cypher"
    }

    fn handle(&self, records: &[SinkRecord]) -> Translation {
        let parameters: Vec<JsonMap> = records.iter().map(|r| self.event_for(r)).collect();
        let events = if parameters.is_empty() {
            Vec::new()
        } else {
            vec![QueryEvents::new(self.statement.clone(), parameters)]
        };
        Translation {
            events,
            failures: Vec::new(),
        }
    }
}
