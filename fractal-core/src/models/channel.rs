use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entity::Namespace;
use super::fixture::FixtureEntry;
use super::metadata::{Metadata, DEVICES_ROOM_ID, ROOM_ID};

/// Fixture model name for channels.
pub const CHANNEL_MODEL: &str = "fractal.replicationchannel";

/// Binding from a database to one transport destination.
///
/// Exactly one channel per database is the origin; the structure realized for
/// every other channel is nested under the origin's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub database_id: Uuid,
    pub name: String,
    /// Transport endpoint (homeserver URL) this channel replicates to.
    pub endpoint: String,
    pub origin: bool,
    pub enabled: bool,
    pub source: bool,
    pub target: bool,
    pub object_version: u64,
    pub deleted: bool,
    pub metadata: Metadata,
}

impl Channel {
    pub fn new(database_id: Uuid, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            id: Uuid::new_v4(),
            database_id,
            name: format!("channel@{}", endpoint),
            endpoint,
            origin: false,
            enabled: true,
            source: true,
            target: true,
            object_version: 0,
            deleted: false,
            metadata: Metadata::new(),
        }
    }

    pub fn with_origin(mut self, origin: bool) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn touch(&mut self) {
        self.object_version += 1;
    }

    /// Physical root space of this channel, once realized.
    pub fn room_id(&self) -> Option<&str> {
        self.metadata.get_str(ROOM_ID)
    }

    pub fn devices_room_id(&self) -> Option<&str> {
        self.metadata.get_str(DEVICES_ROOM_ID)
    }

    pub fn namespace_room_id(&self, namespace: Namespace) -> Option<&str> {
        self.metadata.get_str(namespace.metadata_label())
    }

    /// Whether this channel receives replicated data.
    pub fn is_active_target(&self) -> bool {
        self.enabled && self.target && !self.deleted
    }

    pub fn to_fixture(&self) -> Result<FixtureEntry, serde_json::Error> {
        FixtureEntry::from_record(CHANNEL_MODEL, self)
    }

    pub fn from_fixture(entry: &FixtureEntry) -> Result<Self, serde_json::Error> {
        entry.to_record()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::APPS_ROOM_ID;

    #[test]
    fn test_new_channel_defaults() {
        let db_id = Uuid::new_v4();
        let channel = Channel::new(db_id, "http://localhost:8008");

        assert_eq!(channel.database_id, db_id);
        assert!(!channel.origin);
        assert!(channel.is_active_target());
        assert!(channel.room_id().is_none());
    }

    #[test]
    fn test_namespace_room_lookup() {
        let mut channel = Channel::new(Uuid::new_v4(), "http://localhost:8008");
        channel.metadata.insert(ROOM_ID, "!root:localhost");
        channel.metadata.insert(APPS_ROOM_ID, "!apps:localhost");

        assert_eq!(channel.namespace_room_id(Namespace::Root), Some("!root:localhost"));
        assert_eq!(channel.namespace_room_id(Namespace::Apps), Some("!apps:localhost"));
        assert_eq!(channel.namespace_room_id(Namespace::Services), None);
    }

    #[test]
    fn test_disabled_channel_is_not_a_target() {
        let mut channel = Channel::new(Uuid::new_v4(), "http://localhost:8008");
        channel.enabled = false;
        assert!(!channel.is_active_target());
    }
}
