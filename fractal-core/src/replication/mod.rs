//! Replication log pipeline: batch, prune, encode, push. Plus the receiving
//! side, which applies fixtures with the same version-max rule.

mod apply;
mod pipeline;

pub use apply::{apply_fixture, ApplyReport};
pub use pipeline::{Pipeline, PushReport, MAX_PUSH_ATTEMPTS};

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::models::FixtureEntry;

/// Collapses a fixture to one entry per `(model, pk)`, keeping the highest
/// `object_version`. Ties keep the entry seen first; output follows the order
/// in which keys first appeared.
pub fn prune(entries: impl IntoIterator<Item = FixtureEntry>) -> Vec<FixtureEntry> {
    let mut positions: HashMap<(String, String), usize> = HashMap::new();
    let mut pruned: Vec<FixtureEntry> = Vec::new();

    for entry in entries {
        let key = (entry.model.clone(), entry.pk.clone());
        match positions.get(&key) {
            Some(&index) => {
                if entry.object_version() > pruned[index].object_version() {
                    pruned[index] = entry;
                }
            }
            None => {
                positions.insert(key, pruned.len());
                pruned.push(entry);
            }
        }
    }
    pruned
}

/// Rewrites every floating point number in the fixture as a string; the
/// transport's canonical encoding only carries integers.
pub fn encode_fixture(entries: &[FixtureEntry]) -> Vec<FixtureEntry> {
    entries
        .iter()
        .map(|entry| {
            let fields: Map<String, Value> = entry
                .fields
                .iter()
                .map(|(key, value)| (key.clone(), encode_value(value)))
                .collect();
            FixtureEntry::new(entry.model.clone(), entry.pk.clone(), fields)
        })
        .collect()
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => Value::String(n.to_string()),
        Value::Array(items) => Value::Array(items.iter().map(encode_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), encode_value(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}
