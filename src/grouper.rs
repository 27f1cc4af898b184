//! Statement grouping
//!
//! Within a batch, handler outputs that share an identical statement string
//! are coalesced into a single invocation by appending their parameter
//! lists. Input order is preserved on both axes: groups keep the position
//! of their first occurrence, and parameters keep the order they arrived
//! in, so records from one partition never reorder.

use crate::types::QueryEvents;
use std::collections::HashMap;

/// Coalesce query events sharing a statement string.
///
/// Running the grouper on its own output is a no-op.
pub fn group(events: impl IntoIterator<Item = QueryEvents>) -> Vec<QueryEvents> {
    let mut grouped: Vec<QueryEvents> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        match index.get(&event.statement) {
            Some(&i) => grouped[i].parameters.extend(event.parameters),
            None => {
                index.insert(event.statement.clone(), grouped.len());
                grouped.push(event);
            }
        }
    }

    grouped.retain(|g| !g.is_empty());
    grouped
}
