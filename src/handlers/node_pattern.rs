//! Node pattern strategy
//!
//! Projects each record onto a configured node pattern: the key properties
//! drive a `MERGE`, the remaining value fields become properties per the
//! pattern's selection mode. Tombstones delete the keyed node.

use super::{
    flatten_properties, project_keys, project_properties, GroupedEvents, RecordFailure,
    SinkHandler, Translation,
};
use crate::error::SinkError;
use crate::pattern::NodePattern;
use crate::query::{key_match_clause, label_clause, EVENT_PRELUDE};
use crate::types::{JsonMap, SinkRecord};

/// Operations a node pattern can induce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeOp {
    Merge,
    Delete,
}

/// Handler applying a node pattern per topic
pub struct NodePatternHandler {
    pattern: NodePattern,
    merge_statement: String,
    delete_statement: String,
}

impl NodePatternHandler {
    /// Build the handler and its two statement shapes
    pub fn new(pattern: NodePattern) -> Self {
        let labels = label_clause(&pattern.labels);
        let keys = key_match_clause("event.keys", &pattern.keys);
        let set_clause = if pattern.merge_properties {
            "SET n += event.properties"
        } else {
            "SET n = event.properties SET n += event.keys"
        };

        let merge_statement =
            format!("{EVENT_PRELUDE} MERGE (n{labels} {keys}) {set_clause}");
        let delete_statement =
            format!("{EVENT_PRELUDE} MATCH (n{labels} {keys}) DETACH DELETE n");

        Self {
            pattern,
            merge_statement,
            delete_statement,
        }
    }

    fn statement_for(&self, op: NodeOp) -> String {
        match op {
            NodeOp::Merge => self.merge_statement.clone(),
            NodeOp::Delete => self.delete_statement.clone(),
        }
    }

    /// The map the key properties are looked up in: the record value for
    /// upserts, the record key for tombstones.
    fn identity_source(record: &SinkRecord) -> Result<JsonMap, SinkError> {
        let source = if record.is_tombstone() {
            &record.key
        } else {
            &record.value
        };
        match source {
            serde_json::Value::Object(map) => Ok(flatten_properties(map)),
            other => Err(SinkError::malformed(format!(
                "expected an object, got {other}"
            ))),
        }
    }

    fn translate(&self, record: &SinkRecord) -> Result<(NodeOp, JsonMap), SinkError> {
        let flat = Self::identity_source(record)?;
        let keys = project_keys(&self.pattern.keys, &flat)?;

        let mut event = JsonMap::new();
        if record.is_tombstone() {
            event.insert("keys".to_string(), serde_json::Value::Object(keys));
            return Ok((NodeOp::Delete, event));
        }

        let properties = project_properties(
            self.pattern.pattern_type,
            &self.pattern.properties,
            &flat,
            &self.pattern.keys,
        );
        event.insert("keys".to_string(), serde_json::Value::Object(keys));
        event.insert("properties".to_string(), serde_json::Value::Object(properties));
        Ok((NodeOp::Merge, event))
    }
}

impl SinkHandler for NodePatternHandler {
    fn strategy(&self) -> &'static str {
        "pattern.node"
    }

    fn handle(&self, records: &[SinkRecord]) -> Translation {
        let mut grouped: GroupedEvents<NodeOp> = GroupedEvents::new();
        let mut failures = Vec::new();

        for record in records {
            match self.translate(record) {
                Ok((op, event)) => grouped.push(op, event),
                Err(error) => failures.push(RecordFailure::of(record, error)),
            }
        }

        Translation {
            events: grouped.into_query_events(|op| self.statement_for(*op)),
            failures,
        }
    }
}
