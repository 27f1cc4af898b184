//! Constraint-driven change event strategy
//!
//! Change events carry the constraints in force when the change happened;
//! the handler merges nodes and relationships by the properties of the
//! smallest qualifying uniqueness constraint. Events without a qualifying
//! constraint cannot be identified and are dropped from the output; the
//! drop is counted but not reported as an error.

use super::{GroupedEvents, RecordFailure, SinkHandler, Translation};
use crate::cdc::{EventPayload, NodePayload, Operation, RelationshipPayload, StreamsTransactionEvent};
use crate::error::SinkError;
use crate::metrics::PipelineMetrics;
use crate::query::{key_match_clause, label_clause, quote, EVENT_PRELUDE};
use crate::schema::{node_keys, Constraint, NodeSchemaMetadata, RelationshipSchemaMetadata};
use crate::types::{JsonMap, SinkRecord};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Statement groups induced by change events
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SchemaGroup {
    NodeUpsert(NodeSchemaMetadata),
    NodeDelete(NodeSchemaMetadata),
    RelationshipUpsert(RelationshipSchemaMetadata),
    RelationshipDelete(RelationshipSchemaMetadata),
}

/// Handler merging change events by constraint-derived keys
pub struct CdcSchemaHandler {
    metrics: Arc<PipelineMetrics>,
}

impl CdcSchemaHandler {
    /// Create the handler with a shared metrics handle
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self { metrics }
    }

    fn drop_event(&self, record: &SinkRecord, entity: &str) {
        PipelineMetrics::incr(&self.metrics.cdc_dropped_no_constraint);
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "dropping {entity} change event without a qualifying constraint"
        );
    }

    fn translate_node(
        &self,
        record: &SinkRecord,
        event: &StreamsTransactionEvent,
        node: &NodePayload,
    ) -> Result<Option<(SchemaGroup, JsonMap)>, SinkError> {
        let operation = event.meta.operation;
        let state = node
            .state_for(operation)
            .ok_or_else(|| SinkError::malformed("node change event without an image"))?;

        let constraints: Vec<Constraint> = event
            .unique_constraints()
            .into_iter()
            .filter(|c| state.labels.contains(&c.label))
            .collect();
        let property_keys: BTreeSet<String> = state.properties.keys().cloned().collect();
        let keys = node_keys(&state.labels, &property_keys, &constraints);
        if keys.is_empty() {
            self.drop_event(record, "node");
            return Ok(None);
        }

        let key_values: JsonMap = keys
            .iter()
            .filter_map(|k| state.properties.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let mut params = JsonMap::new();
        params.insert("keys".to_string(), serde_json::Value::Object(key_values));

        if operation == Operation::Deleted {
            let metadata = NodeSchemaMetadata {
                constraints,
                labels_to_add: Vec::new(),
                labels_to_delete: state.labels.clone(),
                keys,
            };
            return Ok(Some((SchemaGroup::NodeDelete(metadata), params)));
        }

        // Labels participating in a constraint are carried by the merge
        // clause; only the rest are added or removed explicitly.
        let covered: BTreeSet<&String> = constraints.iter().map(|c| &c.label).collect();
        let before_labels: Vec<String> = node
            .before
            .as_ref()
            .map(|s| s.labels.clone())
            .unwrap_or_default();
        let labels_to_add: Vec<String> = state
            .labels
            .iter()
            .filter(|l| !before_labels.contains(l) && !covered.contains(l))
            .cloned()
            .collect();
        let labels_to_delete: Vec<String> = before_labels
            .iter()
            .filter(|l| !state.labels.contains(l) && !covered.contains(l))
            .cloned()
            .collect();

        params.insert(
            "properties".to_string(),
            serde_json::Value::Object(state.properties.clone()),
        );
        let metadata = NodeSchemaMetadata {
            constraints,
            labels_to_add,
            labels_to_delete,
            keys,
        };
        Ok(Some((SchemaGroup::NodeUpsert(metadata), params)))
    }

    fn translate_relationship(
        &self,
        record: &SinkRecord,
        event: &StreamsTransactionEvent,
        rel: &RelationshipPayload,
    ) -> Result<Option<(SchemaGroup, JsonMap)>, SinkError> {
        let constraints = event.unique_constraints();

        let start_props: BTreeSet<String> = rel.start.ids.keys().cloned().collect();
        let end_props: BTreeSet<String> = rel.end.ids.keys().cloned().collect();
        let start_keys = node_keys(&rel.start.labels, &start_props, &constraints);
        let end_keys = node_keys(&rel.end.labels, &end_props, &constraints);
        if start_keys.is_empty() || end_keys.is_empty() {
            self.drop_event(record, "relationship");
            return Ok(None);
        }

        let project = |keys: &BTreeSet<String>, ids: &JsonMap| -> JsonMap {
            keys.iter()
                .filter_map(|k| ids.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        };

        let mut params = JsonMap::new();
        params.insert(
            "start".to_string(),
            serde_json::Value::Object(project(&start_keys, &rel.start.ids)),
        );
        params.insert(
            "end".to_string(),
            serde_json::Value::Object(project(&end_keys, &rel.end.ids)),
        );

        let metadata = RelationshipSchemaMetadata {
            label: rel.label.clone(),
            start_labels: rel.start.labels.clone(),
            end_labels: rel.end.labels.clone(),
            start_keys,
            end_keys,
        };

        if event.meta.operation == Operation::Deleted {
            return Ok(Some((SchemaGroup::RelationshipDelete(metadata), params)));
        }

        let properties = rel
            .after
            .as_ref()
            .ok_or_else(|| SinkError::malformed("relationship change event without an image"))?
            .properties
            .clone();
        params.insert("properties".to_string(), serde_json::Value::Object(properties));
        Ok(Some((SchemaGroup::RelationshipUpsert(metadata), params)))
    }

    fn translate(
        &self,
        record: &SinkRecord,
    ) -> Result<Option<(SchemaGroup, JsonMap)>, SinkError> {
        let event: StreamsTransactionEvent = serde_json::from_value(record.value.clone())
            .map_err(|e| SinkError::malformed(format!("not a transaction event: {e}")))?;

        match &event.payload {
            EventPayload::Node(node) => self.translate_node(record, &event, node),
            EventPayload::Relationship(rel) => {
                self.translate_relationship(record, &event, rel)
            }
        }
    }

    fn statement_for(group: &SchemaGroup) -> String {
        match group {
            SchemaGroup::NodeUpsert(meta) => {
                let merge_labels: Vec<String> = meta
                    .constraints
                    .iter()
                    .map(|c| c.label.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let labels = label_clause(&merge_labels);
                let keys = key_match_clause("event.keys", &meta.keys);
                let mut statement = format!(
                    "{EVENT_PRELUDE} MERGE (n{labels} {keys}) SET n = event.properties"
                );
                if !meta.labels_to_add.is_empty() {
                    statement.push_str(&format!(" SET n{}", label_clause(&meta.labels_to_add)));
                }
                if !meta.labels_to_delete.is_empty() {
                    statement
                        .push_str(&format!(" REMOVE n{}", label_clause(&meta.labels_to_delete)));
                }
                statement
            }
            SchemaGroup::NodeDelete(meta) => {
                let labels = label_clause(&meta.labels_to_delete);
                let keys = key_match_clause("event.keys", &meta.keys);
                format!("{EVENT_PRELUDE} MATCH (n{labels} {keys}) DETACH DELETE n")
            }
            SchemaGroup::RelationshipUpsert(meta) => {
                let start = key_match_clause("event.start", &meta.start_keys);
                let end = key_match_clause("event.end", &meta.end_keys);
                format!(
                    "{EVENT_PRELUDE} MERGE (start{} {start}) MERGE (end{} {end}) \
                     MERGE (start)-[r:{}]->(end) SET r = event.properties",
                    label_clause(&meta.start_labels),
                    label_clause(&meta.end_labels),
                    quote(&meta.label),
                )
            }
            SchemaGroup::RelationshipDelete(meta) => {
                let start = key_match_clause("event.start", &meta.start_keys);
                let end = key_match_clause("event.end", &meta.end_keys);
                format!(
                    "{EVENT_PRELUDE} MATCH (start{} {start})-[r:{}]->(end{} {end}) DELETE r",
                    label_clause(&meta.start_labels),
                    quote(&meta.label),
                    label_clause(&meta.end_labels),
                )
            }
        }
    }
}

impl SinkHandler for CdcSchemaHandler {
    fn strategy(&self) -> &'static str {
        "cdc.schema"
    }

    fn handle(&self, records: &[SinkRecord]) -> Translation {
        let mut grouped: GroupedEvents<SchemaGroup> = GroupedEvents::new();
        let mut failures = Vec::new();

        for record in records {
            if record.is_tombstone() {
                debug!(
                    topic = %record.topic,
                    offset = record.offset,
                    "ignoring tombstone on change event topic"
                );
                continue;
            }
            match self.translate(record) {
                Ok(Some((group, params))) => grouped.push(group, params),
                Ok(None) => {}
                Err(error) => failures.push(RecordFailure::of(record, error)),
            }
        }

        Translation {
            events: grouped.into_query_events(Self::statement_for),
            failures,
        }
    }
}
