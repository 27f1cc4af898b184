//! Change-data-capture event model
//!
//! The envelope published by the graph's transaction event stream: metadata
//! about the originating transaction, a before/after image of the changed
//! entity, and the schema (constraints) in force when the change happened.

use crate::schema::Constraint;
use crate::types::JsonMap;
use serde::{Deserialize, Serialize};

/// A single change event from the graph's transaction stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsTransactionEvent {
    /// Transaction metadata
    pub meta: EventMeta,
    /// The changed entity's before/after images
    pub payload: EventPayload,
    /// Schema in force at the time of the change
    #[serde(default)]
    pub schema: EventSchema,
}

/// Transaction metadata attached to every change event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Transaction commit time (epoch millis)
    pub timestamp: i64,
    /// User that committed the transaction
    #[serde(default)]
    pub username: String,
    /// Transaction identifier
    #[serde(rename = "txId")]
    pub tx_id: i64,
    /// Position of this event within the transaction
    #[serde(rename = "txEventId")]
    pub tx_event_id: i64,
    /// Number of events the transaction produced
    #[serde(rename = "txEventsCount")]
    pub tx_events_count: i64,
    /// What happened to the entity
    pub operation: Operation,
    /// Source system details
    #[serde(default)]
    pub source: JsonMap,
}

/// Operation recorded by a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Entity was created
    Created,
    /// Entity was updated
    Updated,
    /// Entity was deleted
    Deleted,
}

/// The changed entity, tagged by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventPayload {
    /// A node change
    Node(NodePayload),
    /// A relationship change
    Relationship(RelationshipPayload),
}

/// Before/after images of a changed node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePayload {
    /// Opaque entity identifier assigned by the source
    pub id: String,
    /// State before the change (absent for creations)
    #[serde(default)]
    pub before: Option<NodeState>,
    /// State after the change (absent for deletions)
    #[serde(default)]
    pub after: Option<NodeState>,
}

/// A node's labels and properties at one point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
    /// Labels on the node
    #[serde(default)]
    pub labels: Vec<String>,
    /// Properties on the node
    #[serde(default)]
    pub properties: JsonMap,
}

/// Before/after images of a changed relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipPayload {
    /// Opaque entity identifier assigned by the source
    pub id: String,
    /// Relationship type
    pub label: String,
    /// Start node reference
    pub start: RelationshipNodeRef,
    /// End node reference
    pub end: RelationshipNodeRef,
    /// State before the change (absent for creations)
    #[serde(default)]
    pub before: Option<RelationshipState>,
    /// State after the change (absent for deletions)
    #[serde(default)]
    pub after: Option<RelationshipState>,
}

/// Identity of a relationship endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipNodeRef {
    /// Opaque entity identifier assigned by the source
    pub id: String,
    /// Labels on the endpoint node
    #[serde(default)]
    pub labels: Vec<String>,
    /// Identifying properties of the endpoint node
    #[serde(default)]
    pub ids: JsonMap,
}

/// A relationship's properties at one point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipState {
    /// Properties on the relationship
    #[serde(default)]
    pub properties: JsonMap,
}

/// Constraints and property types in force when the change happened
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSchema {
    /// Property name to type-name mapping
    #[serde(default)]
    pub properties: std::collections::BTreeMap<String, String>,
    /// Declared constraints
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl StreamsTransactionEvent {
    /// Uniqueness constraints carried by the event's schema
    pub fn unique_constraints(&self) -> Vec<Constraint> {
        self.schema
            .constraints
            .iter()
            .filter(|c| c.constraint_type.is_unique())
            .cloned()
            .collect()
    }
}

impl NodePayload {
    /// The image describing the entity's current identity: `after` for
    /// creations and updates, `before` for deletions.
    pub fn state_for(&self, operation: Operation) -> Option<&NodeState> {
        match operation {
            Operation::Deleted => self.before.as_ref(),
            _ => self.after.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_node_event() -> serde_json::Value {
        json!({
            "meta": {
                "timestamp": 1_532_597_182_604i64,
                "username": "neo4j",
                "txId": 3,
                "txEventId": 0,
                "txEventsCount": 2,
                "operation": "created",
                "source": {"hostname": "graph-0"}
            },
            "payload": {
                "id": "1004",
                "type": "node",
                "after": {
                    "labels": ["Person"],
                    "properties": {"id": 1, "name": "x"}
                }
            },
            "schema": {
                "properties": {"id": "Long", "name": "String"},
                "constraints": [
                    {"label": "Person", "type": "UNIQUE", "properties": ["id"]}
                ]
            }
        })
    }

    #[test]
    fn test_node_event_roundtrip() {
        let event: StreamsTransactionEvent =
            serde_json::from_value(sample_node_event()).unwrap();
        assert_eq!(event.meta.operation, Operation::Created);
        let node = match &event.payload {
            EventPayload::Node(n) => n,
            _ => panic!("expected node payload"),
        };
        assert_eq!(node.id, "1004");
        let after = node.state_for(event.meta.operation).unwrap();
        assert_eq!(after.labels, vec!["Person"]);
        assert_eq!(event.unique_constraints().len(), 1);
    }

    #[test]
    fn test_relationship_event_parsing() {
        let event: StreamsTransactionEvent = serde_json::from_value(json!({
            "meta": {
                "timestamp": 1_532_597_182_604i64,
                "username": "neo4j",
                "txId": 4,
                "txEventId": 1,
                "txEventsCount": 1,
                "operation": "deleted"
            },
            "payload": {
                "id": "500",
                "type": "relationship",
                "label": "KNOWS",
                "start": {"id": "1", "labels": ["Person"], "ids": {"id": 1}},
                "end": {"id": "2", "labels": ["Person"], "ids": {"id": 2}},
                "before": {"properties": {"since": 2011}}
            },
            "schema": {
                "constraints": [
                    {"label": "Person", "type": "UNIQUE", "properties": ["id"]}
                ]
            }
        }))
        .unwrap();

        let rel = match &event.payload {
            EventPayload::Relationship(r) => r,
            _ => panic!("expected relationship payload"),
        };
        assert_eq!(rel.label, "KNOWS");
        assert_eq!(rel.start.ids.get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_deleted_node_uses_before_image() {
        let payload = NodePayload {
            id: "9".to_string(),
            before: Some(NodeState {
                labels: vec!["Person".to_string()],
                properties: JsonMap::new(),
            }),
            after: None,
        };
        assert!(payload.state_for(Operation::Deleted).is_some());
        assert!(payload.state_for(Operation::Updated).is_none());
    }
}
