//! Source-id change event strategy
//!
//! Mirrors entities by the opaque identifier assigned in the source graph
//! instead of by constraints: every node receives a configurable label and
//! an identifier property, and relationships resolve their endpoints by
//! that property. No constraint lookup is needed.

use super::{GroupedEvents, RecordFailure, SinkHandler, Translation};
use crate::cdc::{EventPayload, NodePayload, Operation, RelationshipPayload, StreamsTransactionEvent};
use crate::error::SinkError;
use crate::query::{quote, quote_if_needed, EVENT_PRELUDE};
use crate::types::{JsonMap, SinkRecord};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Naming of the synthetic identity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceIdConfig {
    /// Label applied to every mirrored node
    #[serde(default = "default_label_name")]
    pub label_name: String,
    /// Property holding the source identifier
    #[serde(default = "default_id_name")]
    pub id_name: String,
}

fn default_label_name() -> String {
    "SourceEvent".to_string()
}

fn default_id_name() -> String {
    "sourceId".to_string()
}

impl Default for SourceIdConfig {
    fn default() -> Self {
        Self {
            label_name: default_label_name(),
            id_name: default_id_name(),
        }
    }
}

/// Statement groups induced by source-id change events
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SourceIdGroup {
    NodeUpsert {
        labels_to_add: Vec<String>,
        labels_to_delete: Vec<String>,
    },
    NodeDelete,
    RelationshipUpsert(String),
    RelationshipDelete(String),
}

/// Handler mirroring change events by source identifier
pub struct CdcSourceIdHandler {
    config: SourceIdConfig,
}

impl CdcSourceIdHandler {
    /// Create the handler from its naming configuration
    pub fn new(config: SourceIdConfig) -> Self {
        Self { config }
    }

    fn id_match(&self) -> String {
        let prop = quote_if_needed(&self.config.id_name);
        format!("{{{prop}: event.sourceId}}")
    }

    fn translate_node(
        &self,
        event: &StreamsTransactionEvent,
        node: &NodePayload,
    ) -> Result<(SourceIdGroup, JsonMap), SinkError> {
        let operation = event.meta.operation;
        let mut params = JsonMap::new();
        params.insert(
            "sourceId".to_string(),
            serde_json::Value::String(node.id.clone()),
        );

        if operation == Operation::Deleted {
            return Ok((SourceIdGroup::NodeDelete, params));
        }

        let state = node
            .state_for(operation)
            .ok_or_else(|| SinkError::malformed("node change event without an image"))?;
        let before_labels: Vec<String> = node
            .before
            .as_ref()
            .map(|s| s.labels.clone())
            .unwrap_or_default();
        let labels_to_add: Vec<String> = state
            .labels
            .iter()
            .filter(|l| !before_labels.contains(l))
            .cloned()
            .collect();
        let labels_to_delete: Vec<String> = before_labels
            .iter()
            .filter(|l| !state.labels.contains(l))
            .cloned()
            .collect();

        params.insert(
            "properties".to_string(),
            serde_json::Value::Object(state.properties.clone()),
        );
        Ok((
            SourceIdGroup::NodeUpsert {
                labels_to_add,
                labels_to_delete,
            },
            params,
        ))
    }

    fn translate_relationship(
        &self,
        event: &StreamsTransactionEvent,
        rel: &RelationshipPayload,
    ) -> Result<(SourceIdGroup, JsonMap), SinkError> {
        let mut params = JsonMap::new();
        params.insert(
            "sourceId".to_string(),
            serde_json::Value::String(rel.id.clone()),
        );
        params.insert(
            "start".to_string(),
            serde_json::Value::String(rel.start.id.clone()),
        );
        params.insert(
            "end".to_string(),
            serde_json::Value::String(rel.end.id.clone()),
        );

        if event.meta.operation == Operation::Deleted {
            return Ok((SourceIdGroup::RelationshipDelete(rel.label.clone()), params));
        }

        let properties = rel
            .after
            .as_ref()
            .map(|s| s.properties.clone())
            .unwrap_or_default();
        params.insert("properties".to_string(), serde_json::Value::Object(properties));
        Ok((SourceIdGroup::RelationshipUpsert(rel.label.clone()), params))
    }

    fn statement_for(&self, group: &SourceIdGroup) -> String {
        let label = quote(&self.config.label_name);
        let id_prop = quote_if_needed(&self.config.id_name);
        let id_match = self.id_match();

        match group {
            SourceIdGroup::NodeUpsert {
                labels_to_add,
                labels_to_delete,
            } => {
                let mut statement = format!(
                    "{EVENT_PRELUDE} MERGE (n:{label} {id_match}) \
                     SET n = event.properties SET n.{id_prop} = event.sourceId"
                );
                for l in labels_to_add {
                    statement.push_str(&format!(" SET n:{}", quote(l)));
                }
                for l in labels_to_delete {
                    statement.push_str(&format!(" REMOVE n:{}", quote(l)));
                }
                statement
            }
            SourceIdGroup::NodeDelete => {
                format!("{EVENT_PRELUDE} MATCH (n:{label} {id_match}) DETACH DELETE n")
            }
            SourceIdGroup::RelationshipUpsert(rel_type) => {
                format!(
                    "{EVENT_PRELUDE} \
                     MERGE (start:{label} {{{id_prop}: event.start}}) \
                     MERGE (end:{label} {{{id_prop}: event.end}}) \
                     MERGE (start)-[r:{}]->(end) \
                     SET r = event.properties SET r.{id_prop} = event.sourceId",
                    quote(rel_type)
                )
            }
            SourceIdGroup::RelationshipDelete(rel_type) => {
                format!(
                    "{EVENT_PRELUDE} \
                     MATCH (start:{label} {{{id_prop}: event.start}})\
                     -[r:{}]->(end:{label} {{{id_prop}: event.end}}) DELETE r",
                    quote(rel_type)
                )
            }
        }
    }
}

impl SinkHandler for CdcSourceIdHandler {
    fn strategy(&self) -> &'static str {
        "cdc.sourceId"
    }

    fn handle(&self, records: &[SinkRecord]) -> Translation {
        let mut grouped: GroupedEvents<SourceIdGroup> = GroupedEvents::new();
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
            let event: StreamsTransactionEvent =
                match serde_json::from_value(record.value.clone()) {
                    Ok(event) => event,
                    Err(e) => {
                        failures.push(RecordFailure::of(
                            record,
                            SinkError::malformed(format!("not a transaction event: {e}")),
                        ));
                        continue;
                    }
                };

            let translated = match &event.payload {
                EventPayload::Node(node) => self.translate_node(&event, node),
                EventPayload::Relationship(rel) => self.translate_relationship(&event, rel),
            };
            match translated {
                Ok((group, params)) => grouped.push(group, params),
                Err(error) => failures.push(RecordFailure::of(record, error)),
            }
        }

        Translation {
            events: grouped.into_query_events(|g| self.statement_for(g)),
            failures,
        }
    }
}
