use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metadata label holding the id of an instance's own room.
pub const ROOM_ID: &str = "room_id";
/// Metadata label holding the id of a channel's Devices subspace.
pub const DEVICES_ROOM_ID: &str = "devices_room_id";
/// Metadata label holding the id of a channel's Apps subspace.
pub const APPS_ROOM_ID: &str = "apps_room_id";
/// Metadata label holding the id of a channel's Services subspace.
pub const SERVICES_ROOM_ID: &str = "services_room_id";

/// Opaque key/value bag attached to entities, channels and operations.
///
/// Transport ids are stored here under caller-chosen labels, so a single
/// instance can carry several roles (e.g. `room_id` and `devices_room_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the value under `key` if it is a non-empty string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_str(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Merges `patch` into self. Keys already holding a room id are kept,
    /// so a late duplicate result can never overwrite an existing id.
    pub fn merge(&mut self, patch: &Metadata) {
        for (key, value) in &patch.0 {
            if self.contains(key) {
                continue;
            }
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Copies the keys of `other` that self does not hold at all.
    pub fn fill_missing(&mut self, other: &Metadata) {
        for (key, value) in &other.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_str_ignores_empty_and_non_string() {
        let metadata = Metadata::new()
            .with("room_id", "")
            .with("count", 3)
            .with("name", "Devices");

        assert_eq!(metadata.get_str("room_id"), None);
        assert_eq!(metadata.get_str("count"), None);
        assert_eq!(metadata.get_str("name"), Some("Devices"));
    }

    #[test]
    fn test_merge_keeps_existing_ids() {
        let mut metadata = Metadata::new().with(ROOM_ID, "!first:localhost");
        let patch = Metadata::new()
            .with(ROOM_ID, "!second:localhost")
            .with(DEVICES_ROOM_ID, "!devices:localhost");

        metadata.merge(&patch);

        assert_eq!(metadata.get_str(ROOM_ID), Some("!first:localhost"));
        assert_eq!(metadata.get_str(DEVICES_ROOM_ID), Some("!devices:localhost"));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let metadata = Metadata::new().with("name", "Apps");
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"name":"Apps"}"#);
    }
}
