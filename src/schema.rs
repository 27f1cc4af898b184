//! Constraint metadata and merge-key selection
//!
//! Change events carry the graph's declared constraints; the sink uses them
//! to decide which properties identify a node. The grouping metadata types
//! here are plain value types: equality and hashing are structural so they
//! can key per-batch statement groups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of a declared constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintType {
    /// Uniqueness constraint on one or more properties
    #[serde(rename = "UNIQUE")]
    Unique,
    /// Composite node key
    #[serde(rename = "NODE_KEY")]
    NodeKey,
    /// Property existence on nodes
    #[serde(rename = "NODE_PROPERTY_EXISTS")]
    NodePropertyExists,
    /// Property existence on relationships
    #[serde(rename = "RELATIONSHIP_PROPERTY_EXISTS")]
    RelationshipPropertyExists,
}

impl ConstraintType {
    /// Whether this constraint identifies nodes
    pub fn is_unique(&self) -> bool {
        matches!(self, Self::Unique | Self::NodeKey)
    }
}

/// A declared constraint on a label's properties
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    /// Label the constraint is declared on
    pub label: String,
    /// Constraint kind
    #[serde(rename = "type")]
    pub constraint_type: ConstraintType,
    /// Constrained property names
    pub properties: BTreeSet<String>,
}

/// Select the properties that identify a node.
///
/// Considers uniqueness constraints declared on any of `labels` whose
/// properties are all present in `property_keys`, and returns the
/// properties of the smallest such constraint. Ties break by the position
/// of the constraint's label in `labels`, then by the sorted property
/// tuple. Returns an empty set when no constraint qualifies.
///
/// The choice is observable: it decides which record fields become the
/// merge key of the emitted statement.
pub fn node_keys(
    labels: &[String],
    property_keys: &BTreeSet<String>,
    constraints: &[Constraint],
) -> BTreeSet<String> {
    let mut candidates: Vec<&Constraint> = constraints
        .iter()
        .filter(|c| c.constraint_type.is_unique())
        .filter(|c| !c.properties.is_empty())
        .filter(|c| labels.contains(&c.label))
        .filter(|c| c.properties.is_subset(property_keys))
        .collect();

    let label_position =
        |c: &Constraint| labels.iter().position(|l| l == &c.label).unwrap_or(usize::MAX);

    candidates.sort_by(|a, b| {
        a.properties
            .len()
            .cmp(&b.properties.len())
            .then_with(|| label_position(a).cmp(&label_position(b)))
            .then_with(|| a.properties.cmp(&b.properties))
    });

    candidates
        .first()
        .map(|c| c.properties.clone())
        .unwrap_or_default()
}

/// Grouping key for node change events sharing a statement shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeSchemaMetadata {
    /// Uniqueness constraints relevant to the event
    pub constraints: Vec<Constraint>,
    /// Labels the statement adds
    pub labels_to_add: Vec<String>,
    /// Labels the statement removes (for deletions: the matched labels)
    pub labels_to_delete: Vec<String>,
    /// Properties forming the merge key
    pub keys: BTreeSet<String>,
}

/// Grouping key for relationship change events sharing a statement shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipSchemaMetadata {
    /// Relationship type
    pub label: String,
    /// Labels of the start node
    pub start_labels: Vec<String>,
    /// Labels of the end node
    pub end_labels: Vec<String>,
    /// Merge-key properties of the start node
    pub start_keys: BTreeSet<String>,
    /// Merge-key properties of the end node
    pub end_keys: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(label: &str, ty: ConstraintType, props: &[&str]) -> Constraint {
        Constraint {
            label: label.to_string(),
            constraint_type: ty,
            properties: props.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn keyset(v: &[&str]) -> BTreeSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_selects_matching_constraint() {
        let constraints = vec![constraint("Person", ConstraintType::Unique, &["id"])];
        let keys = node_keys(
            &strings(&["Person"]),
            &keyset(&["id", "name"]),
            &constraints,
        );
        assert_eq!(keys, keyset(&["id"]));
    }

    #[test]
    fn test_smallest_constraint_wins() {
        let constraints = vec![
            constraint("Person", ConstraintType::NodeKey, &["first", "last"]),
            constraint("Person", ConstraintType::Unique, &["ssn"]),
        ];
        let keys = node_keys(
            &strings(&["Person"]),
            &keyset(&["first", "last", "ssn"]),
            &constraints,
        );
        assert_eq!(keys, keyset(&["ssn"]));
    }

    #[test]
    fn test_label_order_breaks_ties() {
        let constraints = vec![
            constraint("Employee", ConstraintType::Unique, &["badge"]),
            constraint("Person", ConstraintType::Unique, &["id"]),
        ];
        let keys = node_keys(
            &strings(&["Person", "Employee"]),
            &keyset(&["id", "badge"]),
            &constraints,
        );
        assert_eq!(keys, keyset(&["id"]));
    }

    #[test]
    fn test_property_tuple_breaks_remaining_ties() {
        let constraints = vec![
            constraint("Person", ConstraintType::Unique, &["email"]),
            constraint("Person", ConstraintType::Unique, &["alias"]),
        ];
        let keys = node_keys(
            &strings(&["Person"]),
            &keyset(&["email", "alias"]),
            &constraints,
        );
        assert_eq!(keys, keyset(&["alias"]));
    }

    #[test]
    fn test_constraint_not_covered_by_properties() {
        let constraints = vec![constraint("Person", ConstraintType::Unique, &["ssn"])];
        let keys = node_keys(&strings(&["Person"]), &keyset(&["id", "name"]), &constraints);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_existence_constraints_ignored() {
        let constraints = vec![constraint(
            "Person",
            ConstraintType::NodePropertyExists,
            &["id"],
        )];
        let keys = node_keys(&strings(&["Person"]), &keyset(&["id"]), &constraints);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_unrelated_label_ignored() {
        let constraints = vec![constraint("Product", ConstraintType::Unique, &["sku"])];
        let keys = node_keys(&strings(&["Person"]), &keyset(&["sku"]), &constraints);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_constraint_deserialization() {
        let c: Constraint = serde_json::from_str(
            r#"{"label": "Person", "type": "UNIQUE", "properties": ["id"]}"#,
        )
        .unwrap();
        assert_eq!(c.constraint_type, ConstraintType::Unique);
        assert_eq!(c.properties, keyset(&["id"]));
    }
}
