//! Relationship pattern strategy
//!
//! Projects each record onto a configured relationship pattern: endpoint
//! key properties drive `MERGE`s of the two nodes and of the relationship,
//! the remaining fields become relationship properties. Tombstones delete
//! the relationship only, never the endpoint nodes.

use super::{
    flatten_properties, project_keys, project_properties, GroupedEvents, RecordFailure,
    SinkHandler, Translation,
};
use crate::error::SinkError;
use crate::pattern::RelationshipPattern;
use crate::query::{key_match_clause, label_clause, quote, EVENT_PRELUDE};
use crate::types::{JsonMap, SinkRecord};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RelOp {
    Merge,
    Delete,
}

/// Handler applying a relationship pattern per topic
pub struct RelationshipPatternHandler {
    pattern: RelationshipPattern,
    merge_statement: String,
    delete_statement: String,
}

impl RelationshipPatternHandler {
    /// Build the handler and its two statement shapes
    pub fn new(pattern: RelationshipPattern) -> Self {
        let start_labels = label_clause(&pattern.start.labels);
        let end_labels = label_clause(&pattern.end.labels);
        let start_keys = key_match_clause("event.start", &pattern.start.keys);
        let end_keys = key_match_clause("event.end", &pattern.end.keys);
        let rel_type = quote(&pattern.rel_type);
        let set_clause = if pattern.merge_properties {
            "SET r += event.properties"
        } else {
            "SET r = event.properties"
        };

        let merge_statement = format!(
            "{EVENT_PRELUDE} MERGE (start{start_labels} {start_keys}) \
             MERGE (end{end_labels} {end_keys}) \
             MERGE (start)-[r:{rel_type}]->(end) {set_clause}"
        );
        let delete_statement = format!(
            "{EVENT_PRELUDE} MATCH (start{start_labels} {start_keys})\
             -[r:{rel_type}]->(end{end_labels} {end_keys}) DELETE r"
        );

        Self {
            pattern,
            merge_statement,
            delete_statement,
        }
    }

    fn statement_for(&self, op: RelOp) -> String {
        match op {
            RelOp::Merge => self.merge_statement.clone(),
            RelOp::Delete => self.delete_statement.clone(),
        }
    }

    fn translate(&self, record: &SinkRecord) -> Result<(RelOp, JsonMap), SinkError> {
        let source = if record.is_tombstone() {
            &record.key
        } else {
            &record.value
        };
        let flat = match source {
            serde_json::Value::Object(map) => flatten_properties(map),
            other => {
                return Err(SinkError::malformed(format!(
                    "expected an object, got {other}"
                )))
            }
        };

        let start = project_keys(&self.pattern.start.keys, &flat)?;
        let end = project_keys(&self.pattern.end.keys, &flat)?;

        let mut event = JsonMap::new();
        event.insert("start".to_string(), serde_json::Value::Object(start));
        event.insert("end".to_string(), serde_json::Value::Object(end));
        if record.is_tombstone() {
            return Ok((RelOp::Delete, event));
        }

        // Endpoint key fields never leak into the relationship's properties.
        let endpoint_keys: BTreeSet<String> = self
            .pattern
            .start
            .keys
            .union(&self.pattern.end.keys)
            .cloned()
            .collect();
        let properties = project_properties(
            self.pattern.pattern_type,
            &self.pattern.properties,
            &flat,
            &endpoint_keys,
        );
        event.insert("properties".to_string(), serde_json::Value::Object(properties));
        Ok((RelOp::Merge, event))
    }
}

impl SinkHandler for RelationshipPatternHandler {
    fn strategy(&self) -> &'static str {
        "pattern.relationship"
    }

    fn handle(&self, records: &[SinkRecord]) -> Translation {
        let mut grouped: GroupedEvents<RelOp> = GroupedEvents::new();
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(pattern: &str) -> RelationshipPatternHandler {
        RelationshipPatternHandler::new(RelationshipPattern::parse(pattern, false).unwrap())
    }

    fn record(offset: i64, value: serde_json::Value) -> SinkRecord {
        SinkRecord::new("orders", 0, offset).with_value(value)
    }

    #[test]
    fn test_merge_statement_shape() {
        let handler = handler("(:User{!uid})-[:BOUGHT]->(:Product{!sku})");
        let translation = handler.handle(&[record(
            0,
            json!({"uid": 1, "sku": "a-1", "price": 10}),
        )]);

        assert_eq!(
            translation.events[0].statement,
            "UNWIND $events AS event \
             MERGE (start:`User` {uid: event.start.uid}) \
             MERGE (end:`Product` {sku: event.end.sku}) \
             MERGE (start)-[r:`BOUGHT`]->(end) SET r = event.properties"
        );
        assert_eq!(
            translation.events[0].parameters[0],
            json!({
                "start": {"uid": 1},
                "end": {"sku": "a-1"},
                "properties": {"price": 10}
            })
            .as_object()
            .unwrap()
            .clone()
        );
    }

    #[test]
    fn test_include_selection() {
        let handler = handler("(:User{!uid})-[:BOUGHT{price}]->(:Product{!sku})");
        let translation = handler.handle(&[record(
            0,
            json!({"uid": 1, "sku": "a", "price": 10, "note": "x"}),
        )]);
        let event = &translation.events[0].parameters[0];
        assert_eq!(event.get("properties"), Some(&json!({"price": 10})));
    }

    #[test]
    fn test_tombstone_deletes_relationship_only() {
        let handler = handler("(:User{!uid})-[:BOUGHT]->(:Product{!sku})");
        let tombstone =
            SinkRecord::new("orders", 0, 9).with_key(json!({"uid": 1, "sku": "a"}));
        let translation = handler.handle(&[tombstone]);

        let statement = &translation.events[0].statement;
        assert!(statement.contains("DELETE r"));
        assert!(!statement.contains("DETACH"));
        assert_eq!(
            translation.events[0].parameters[0],
            json!({"start": {"uid": 1}, "end": {"sku": "a"}})
                .as_object()
                .unwrap()
                .clone()
        );
    }

    #[test]
    fn test_reversed_pattern_swaps_endpoints() {
        let handler = handler("(:Product{!sku})<-[:BOUGHT]-(:User{!uid})");
        let translation = handler.handle(&[record(0, json!({"uid": 1, "sku": "a"}))]);
        assert!(translation.events[0]
            .statement
            .contains("MERGE (start:`User` {uid: event.start.uid})"));
    }

    #[test]
    fn test_missing_endpoint_key_is_failure() {
        let handler = handler("(:User{!uid})-[:BOUGHT]->(:Product{!sku})");
        let translation = handler.handle(&[record(0, json!({"uid": 1}))]);
        assert!(translation.events.is_empty());
        assert_eq!(translation.failures.len(), 1);
    }
}
