//! CUD strategy
//!
//! A compact JSON form describing one graph mutation per record:
//!
//! ```json
//! {"op": "merge", "type": "node", "labels": ["User"],
//!  "ids": {"id": 1}, "properties": {"name": "x"}}
//! ```
//!
//! Records inducing the same statement shape (operation, entity kind,
//! labels and identity-key shape) are grouped into one invocation.

use super::{GroupedEvents, RecordFailure, SinkHandler, Translation};
use crate::error::SinkError;
use crate::query::{key_match_clause, label_clause, quote, EVENT_PRELUDE};
use crate::types::{JsonMap, SinkRecord};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Mutation operation of a CUD record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CudOp {
    Create,
    Update,
    Merge,
    Delete,
}

/// How a relationship endpoint is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EndpointOp {
    #[default]
    Match,
    Merge,
}

/// A CUD record, tagged by entity kind
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CudEvent {
    Node(CudNode),
    Relationship(CudRelationship),
}

#[derive(Debug, Deserialize)]
struct CudNode {
    op: CudOp,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    ids: JsonMap,
    #[serde(default)]
    properties: JsonMap,
    #[serde(default = "default_true")]
    detach: bool,
}

#[derive(Debug, Deserialize)]
struct CudRelationship {
    op: CudOp,
    rel_type: String,
    from: CudEndpoint,
    to: CudEndpoint,
    #[serde(default)]
    properties: JsonMap,
}

#[derive(Debug, Deserialize)]
struct CudEndpoint {
    #[serde(default)]
    labels: Vec<String>,
    ids: JsonMap,
    #[serde(default)]
    op: EndpointOp,
}

fn default_true() -> bool {
    true
}

fn id_shape(ids: &JsonMap) -> BTreeSet<String> {
    ids.keys().cloned().collect()
}

/// Handler applying CUD records
pub struct CudHandler;

impl CudHandler {
    fn node_statement(node: &CudNode) -> Result<String, SinkError> {
        let labels = label_clause(&node.labels);
        let shape = id_shape(&node.ids);
        if node.op != CudOp::Create && shape.is_empty() {
            return Err(SinkError::malformed(format!(
                "'{:?}' node operation requires ids",
                node.op
            )));
        }
        let keys = key_match_clause("event.ids", &shape);

        let statement = match node.op {
            CudOp::Create => {
                format!("{EVENT_PRELUDE} CREATE (n{labels}) SET n = event.properties")
            }
            CudOp::Merge => {
                format!("{EVENT_PRELUDE} MERGE (n{labels} {keys}) SET n += event.properties")
            }
            CudOp::Update => {
                format!("{EVENT_PRELUDE} MATCH (n{labels} {keys}) SET n += event.properties")
            }
            CudOp::Delete => {
                let delete = if node.detach { "DETACH DELETE" } else { "DELETE" };
                format!("{EVENT_PRELUDE} MATCH (n{labels} {keys}) {delete} n")
            }
        };
        Ok(statement)
    }

    fn endpoint_clause(alias: &str, endpoint: &CudEndpoint) -> Result<String, SinkError> {
        let shape = id_shape(&endpoint.ids);
        if shape.is_empty() {
            return Err(SinkError::malformed(format!(
                "relationship endpoint '{alias}' requires ids"
            )));
        }
        let verb = match endpoint.op {
            EndpointOp::Match => "MATCH",
            EndpointOp::Merge => "MERGE",
        };
        let labels = label_clause(&endpoint.labels);
        let keys = key_match_clause(&format!("event.{alias}"), &shape);
        Ok(format!("{verb} ({alias}{labels} {keys})"))
    }

    fn relationship_statement(rel: &CudRelationship) -> Result<String, SinkError> {
        let from = Self::endpoint_clause("from", &rel.from)?;
        let to = Self::endpoint_clause("to", &rel.to)?;
        let rel_type = quote(&rel.rel_type);

        let tail = match rel.op {
            CudOp::Create => format!("CREATE (from)-[r:{rel_type}]->(to) SET r = event.properties"),
            CudOp::Merge => format!("MERGE (from)-[r:{rel_type}]->(to) SET r += event.properties"),
            CudOp::Update => format!("MATCH (from)-[r:{rel_type}]->(to) SET r += event.properties"),
            CudOp::Delete => format!("MATCH (from)-[r:{rel_type}]->(to) DELETE r"),
        };
        Ok(format!("{EVENT_PRELUDE} {from} {to} {tail}"))
    }

    fn translate(record: &SinkRecord) -> Result<(String, JsonMap), SinkError> {
        let event: CudEvent = serde_json::from_value(record.value.clone())
            .map_err(|e| SinkError::malformed(format!("not a CUD record: {e}")))?;

        match event {
            CudEvent::Node(node) => {
                let statement = Self::node_statement(&node)?;
                let mut params = JsonMap::new();
                params.insert("ids".to_string(), serde_json::Value::Object(node.ids));
                if node.op != CudOp::Delete {
                    params.insert(
                        "properties".to_string(),
                        serde_json::Value::Object(node.properties),
                    );
                }
                Ok((statement, params))
            }
            CudEvent::Relationship(rel) => {
                let statement = Self::relationship_statement(&rel)?;
                let mut params = JsonMap::new();
                params.insert("from".to_string(), serde_json::Value::Object(rel.from.ids));
                params.insert("to".to_string(), serde_json::Value::Object(rel.to.ids));
                if rel.op != CudOp::Delete {
                    params.insert(
                        "properties".to_string(),
                        serde_json::Value::Object(rel.properties),
                    );
                }
                Ok((statement, params))
            }
        }
    }
}

impl SinkHandler for CudHandler {
    fn strategy(&self) -> &'static str {
        "cud"
    }

    fn handle(&self, records: &[SinkRecord]) -> Translation {
        let mut grouped: GroupedEvents<String> = GroupedEvents::new();
        let mut failures = Vec::new();

        for record in records {
            match Self::translate(record) {
                Ok((statement, params)) => grouped.push(statement, params),
                Err(error) => failures.push(RecordFailure::of(record, error)),
            }
        }

        Translation {
            events: grouped.into_query_events(|statement| statement.clone()),
            failures,
        }
    }
}
