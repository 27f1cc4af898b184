//! Statement text assembly and parameter conversion
//!
//! Every emitted statement iterates its `$events` parameter with the same
//! prelude; the helpers here build the per-strategy clauses around it and
//! convert JSON parameter maps into driver values.

use crate::error::ConnectError;
use crate::types::JsonMap;
use neo4rs::{
    BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
};
use std::borrow::Cow;
use std::fmt::Write;

/// Iteration prelude shared by every emitted statement
pub const EVENT_PRELUDE: &str = "UNWIND $events AS event";

/// Quote an identifier with backticks, doubling embedded backticks
pub fn quote(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Quote an identifier only when it is not a plain name
pub fn quote_if_needed(ident: &str) -> Cow<'_, str> {
    let mut chars = ident.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        Cow::Borrowed(ident)
    } else {
        Cow::Owned(quote(ident))
    }
}

/// Render a label sequence as `` :`A`:`B` ``
pub fn label_clause(labels: &[String]) -> String {
    let mut out = String::new();
    for label in labels {
        let _ = write!(out, ":{}", quote(label));
    }
    out
}

/// Render a key-match map such as `{id: event.keys.id}`
///
/// `accessor` is the event sub-map the values come from, e.g. `event.keys`
/// or `event.start`.
pub fn key_match_clause<'a>(accessor: &str, keys: impl IntoIterator<Item = &'a String>) -> String {
    let entries: Vec<String> = keys
        .into_iter()
        .map(|k| {
            let name = quote_if_needed(k);
            format!("{}: {}.{}", name, accessor, name)
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

/// Convert a JSON value into a driver value
pub fn json_to_bolt(value: &serde_json::Value) -> Result<BoltType, ConnectError> {
    let bolt = match value {
        serde_json::Value::Null => BoltType::Null(BoltNull),
        serde_json::Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                BoltType::Integer(BoltInteger::new(i))
            } else if let Some(f) = n.as_f64() {
                BoltType::Float(BoltFloat::new(f))
            } else {
                return Err(ConnectError::Serialization(format!(
                    "unsupported number: {n}"
                )));
            }
        }
        serde_json::Value::String(s) => BoltType::String(BoltString::new(s)),
        serde_json::Value::Array(items) => BoltType::List(BoltList {
            value: items
                .iter()
                .map(json_to_bolt)
                .collect::<Result<_, _>>()?,
        }),
        serde_json::Value::Object(map) => map_to_bolt(map)?,
    };
    Ok(bolt)
}

/// Convert a JSON object into a driver map value
pub fn map_to_bolt(map: &JsonMap) -> Result<BoltType, ConnectError> {
    Ok(BoltType::Map(BoltMap {
        value: map
            .iter()
            .map(|(k, v)| Ok((BoltString::new(k), json_to_bolt(v)?)))
            .collect::<Result<_, ConnectError>>()?,
    }))
}

/// Convert a parameter list into the `$events` driver value
pub fn events_to_bolt(events: &[JsonMap]) -> Result<BoltType, ConnectError> {
    Ok(BoltType::List(BoltList {
        value: events
            .iter()
            .map(map_to_bolt)
            .collect::<Result<_, _>>()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_doubles_backticks() {
        assert_eq!(quote("Person"), "`Person`");
        assert_eq!(quote("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_quote_if_needed() {
        assert_eq!(quote_if_needed("id"), "id");
        assert_eq!(quote_if_needed("first_name"), "first_name");
        assert_eq!(quote_if_needed("first name"), "`first name`");
        assert_eq!(quote_if_needed("1st"), "`1st`");
        assert_eq!(quote_if_needed(""), "``");
    }

    #[test]
    fn test_label_clause() {
        let labels = vec!["LabelA".to_string(), "LabelB".to_string()];
        assert_eq!(label_clause(&labels), ":`LabelA`:`LabelB`");
    }

    #[test]
    fn test_key_match_clause() {
        let keys = vec!["id".to_string()];
        assert_eq!(key_match_clause("event.keys", &keys), "{id: event.keys.id}");

        let keys = vec!["user id".to_string()];
        assert_eq!(
            key_match_clause("event.keys", &keys),
            "{`user id`: event.keys.`user id`}"
        );
    }

    #[test]
    fn test_json_to_bolt_scalars() {
        assert!(matches!(
            json_to_bolt(&json!(null)).unwrap(),
            BoltType::Null(_)
        ));
        assert!(matches!(
            json_to_bolt(&json!(true)).unwrap(),
            BoltType::Boolean(_)
        ));
        assert!(matches!(
            json_to_bolt(&json!(42)).unwrap(),
            BoltType::Integer(_)
        ));
        assert!(matches!(
            json_to_bolt(&json!(2.5)).unwrap(),
            BoltType::Float(_)
        ));
        assert!(matches!(
            json_to_bolt(&json!("x")).unwrap(),
            BoltType::String(_)
        ));
    }

    #[test]
    fn test_json_to_bolt_nested() {
        let value = json!({"a": [1, 2], "b": {"c": "d"}});
        let bolt = json_to_bolt(&value).unwrap();
        assert!(matches!(bolt, BoltType::Map(_)));
    }

    #[test]
    fn test_events_to_bolt() {
        let events = vec![
            json!({"id": 1}).as_object().unwrap().clone(),
            json!({"id": 2}).as_object().unwrap().clone(),
        ];
        let bolt = events_to_bolt(&events).unwrap();
        match bolt {
            BoltType::List(list) => assert_eq!(list.value.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }
}
