//! Sink strategy handlers
//!
//! Each broker topic is served by exactly one handler. A handler is a pure
//! function of its immutable configuration and the record batch: it
//! translates records into [`QueryEvents`] groups and reports per-record
//! translation failures for the tolerance policy to route. Handlers never
//! block and hold no references to records beyond the call.

pub mod cdc_schema;
pub mod cdc_source_id;
pub mod cud;
pub mod cypher;
pub mod node_pattern;
pub mod relationship_pattern;

pub use cdc_schema::CdcSchemaHandler;
pub use cdc_source_id::{CdcSourceIdHandler, SourceIdConfig};
pub use cud::CudHandler;
pub use cypher::{CypherBindings, CypherHandler};
pub use node_pattern::NodePatternHandler;
pub use relationship_pattern::RelationshipPatternHandler;

use crate::error::SinkError;
use crate::metrics::PipelineMetrics;
use crate::pattern::{NodePattern, PatternType, RelationshipPattern};
use crate::types::{JsonMap, QueryEvents, SinkRecord};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

/// Outcome of translating a record batch
#[derive(Debug, Default)]
pub struct Translation {
    /// Query events in emit order
    pub events: Vec<QueryEvents>,
    /// Records that could not be translated
    pub failures: Vec<RecordFailure>,
}

/// A record the handler could not translate
///
/// Carries the whole record so the dead-letter policy can re-publish it.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    /// The refused record
    pub record: SinkRecord,
    /// Why translation failed
    pub error: SinkError,
}

impl RecordFailure {
    pub(crate) fn of(record: &SinkRecord, error: SinkError) -> Self {
        Self {
            record: record.clone(),
            error,
        }
    }
}

/// Capability shared by all sink strategies
pub trait SinkHandler: Send + Sync {
    /// Strategy identifier for logs
    fn strategy(&self) -> &'static str;

    /// Translate a record batch into query events
    fn handle(&self, records: &[SinkRecord]) -> Translation;
}

/// Strategy assigned to a topic, selected at configuration time
#[derive(Debug, Clone)]
pub enum Strategy {
    /// User-provided statement template
    Cypher {
        statement: String,
        bindings: CypherBindings,
    },
    /// Compact create/update/delete JSON form
    Cud,
    /// Declarative node pattern
    NodePattern(NodePattern),
    /// Declarative relationship pattern
    RelationshipPattern(RelationshipPattern),
    /// Change events merged by constraint-derived keys
    CdcSchema,
    /// Change events keyed by opaque source identifiers
    CdcSourceId(SourceIdConfig),
}

impl Strategy {
    /// Stable strategy identifier
    pub fn id(&self) -> &'static str {
        match self {
            Self::Cypher { .. } => "cypher",
            Self::Cud => "cud",
            Self::NodePattern(_) => "pattern.node",
            Self::RelationshipPattern(_) => "pattern.relationship",
            Self::CdcSchema => "cdc.schema",
            Self::CdcSourceId(_) => "cdc.sourceId",
        }
    }

    /// Materialize the handler for this strategy
    pub fn into_handler(self, metrics: Arc<PipelineMetrics>) -> Arc<dyn SinkHandler> {
        match self {
            Self::Cypher {
                statement,
                bindings,
            } => Arc::new(CypherHandler::new(statement, bindings)),
            Self::Cud => Arc::new(CudHandler),
            Self::NodePattern(pattern) => Arc::new(NodePatternHandler::new(pattern)),
            Self::RelationshipPattern(pattern) => {
                Arc::new(RelationshipPatternHandler::new(pattern))
            }
            Self::CdcSchema => Arc::new(CdcSchemaHandler::new(metrics)),
            Self::CdcSourceId(config) => Arc::new(CdcSourceIdHandler::new(config)),
        }
    }
}

/// Parameter lists grouped by statement shape, preserving first-occurrence
/// order of the groups and arrival order within each group
pub(crate) struct GroupedEvents<K> {
    order: Vec<K>,
    groups: HashMap<K, Vec<JsonMap>>,
}

impl<K: Eq + Hash + Clone> GroupedEvents<K> {
    pub(crate) fn new() -> Self {
        Self {
            order: Vec::new(),
            groups: HashMap::new(),
        }
    }

    pub(crate) fn push(&mut self, key: K, params: JsonMap) {
        match self.groups.get_mut(&key) {
            Some(group) => group.push(params),
            None => {
                self.order.push(key.clone());
                self.groups.insert(key, vec![params]);
            }
        }
    }

    pub(crate) fn into_query_events(
        mut self,
        statement: impl Fn(&K) -> String,
    ) -> Vec<QueryEvents> {
        self.order
            .drain(..)
            .map(|key| {
                let parameters = self.groups.remove(&key).unwrap_or_default();
                QueryEvents::new(statement(&key), parameters)
            })
            .collect()
    }
}

/// Flatten nested objects into dot-joined property names
///
/// `{"address": {"city": "x"}}` becomes `{"address.city": "x"}`. Arrays and
/// scalars are kept as values.
pub(crate) fn flatten_properties(map: &JsonMap) -> JsonMap {
    let mut flat = JsonMap::new();
    flatten_into(&mut flat, None, map);
    flat
}

fn flatten_into(out: &mut JsonMap, prefix: Option<&str>, map: &JsonMap) {
    for (key, value) in map {
        let name = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            serde_json::Value::Object(nested) => flatten_into(out, Some(&name), nested),
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}

/// Project the configured key properties out of a flattened value
pub(crate) fn project_keys(
    keys: &BTreeSet<String>,
    flat: &JsonMap,
) -> Result<JsonMap, SinkError> {
    let mut out = JsonMap::new();
    for key in keys {
        match flat.get(key) {
            Some(value) if !value.is_null() => {
                out.insert(key.clone(), value.clone());
            }
            _ => {
                return Err(SinkError::malformed(format!(
                    "record is missing key property '{key}'"
                )))
            }
        }
    }
    Ok(out)
}

/// Project non-key properties according to the pattern's selection mode
pub(crate) fn project_properties(
    pattern_type: PatternType,
    selected: &[String],
    flat: &JsonMap,
    keys: &BTreeSet<String>,
) -> JsonMap {
    match pattern_type {
        PatternType::All => flat
            .iter()
            .filter(|(name, _)| !keys.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        PatternType::Include => selected
            .iter()
            .filter_map(|name| flat.get(name).map(|v| (name.clone(), v.clone())))
            .collect(),
        PatternType::Exclude => flat
            .iter()
            .filter(|(name, _)| {
                !keys.contains(name.as_str()) && !selected.iter().any(|s| s == name.as_str())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_flatten_nested_objects() {
        let flat = flatten_properties(&obj(json!({
            "id": 1,
            "address": {"city": "Berlin", "geo": {"lat": 52.5}},
            "tags": ["a", "b"]
        })));

        assert_eq!(flat.get("id"), Some(&json!(1)));
        assert_eq!(flat.get("address.city"), Some(&json!("Berlin")));
        assert_eq!(flat.get("address.geo.lat"), Some(&json!(52.5)));
        assert_eq!(flat.get("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_project_keys_missing_key_fails() {
        let keys: BTreeSet<String> = ["id".to_string()].into();
        let err = project_keys(&keys, &obj(json!({"name": "x"}))).unwrap_err();
        assert_eq!(err.kind(), "malformed_record");
    }

    #[test]
    fn test_project_properties_modes() {
        let flat = obj(json!({"id": 1, "name": "x", "age": 3}));
        let keys: BTreeSet<String> = ["id".to_string()].into();

        let all = project_properties(PatternType::All, &[], &flat, &keys);
        assert_eq!(all, obj(json!({"name": "x", "age": 3})));

        let include =
            project_properties(PatternType::Include, &["name".to_string()], &flat, &keys);
        assert_eq!(include, obj(json!({"name": "x"})));

        let exclude =
            project_properties(PatternType::Exclude, &["name".to_string()], &flat, &keys);
        assert_eq!(exclude, obj(json!({"age": 3})));
    }

    #[test]
    fn test_grouped_events_order() {
        let mut grouped: GroupedEvents<&'static str> = GroupedEvents::new();
        grouped.push("b", obj(json!({"v": 1})));
        grouped.push("a", obj(json!({"v": 2})));
        grouped.push("b", obj(json!({"v": 3})));

        let events = grouped.into_query_events(|k| format!("stmt {k}"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].statement, "stmt b");
        assert_eq!(events[0].parameters.len(), 2);
        assert_eq!(events[1].statement, "stmt a");
    }
}
