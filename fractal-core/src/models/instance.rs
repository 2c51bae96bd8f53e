use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::channel::Channel;
use super::entity::{Entity, EntityKind};
use super::metadata::Metadata;

/// Discriminator for anything an operation or log entry can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Database,
    App,
    Service,
    Device,
    DeviceMembership,
    Channel,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Database => "database",
            InstanceKind::App => "app",
            InstanceKind::Service => "service",
            InstanceKind::Device => "device",
            InstanceKind::DeviceMembership => "device_membership",
            InstanceKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "database" => Some(InstanceKind::Database),
            "app" => Some(InstanceKind::App),
            "service" => Some(InstanceKind::Service),
            "device" => Some(InstanceKind::Device),
            "device_membership" => Some(InstanceKind::DeviceMembership),
            "channel" => Some(InstanceKind::Channel),
            _ => None,
        }
    }

    /// Entity kind stored in the entity table, `None` for channels.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            InstanceKind::Database => Some(EntityKind::Database),
            InstanceKind::App => Some(EntityKind::App),
            InstanceKind::Service => Some(EntityKind::Service),
            InstanceKind::Device => Some(EntityKind::Device),
            InstanceKind::DeviceMembership => Some(EntityKind::DeviceMembership),
            InstanceKind::Channel => None,
        }
    }
}

impl From<EntityKind> for InstanceKind {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Database => InstanceKind::Database,
            EntityKind::App => InstanceKind::App,
            EntityKind::Service => InstanceKind::Service,
            EntityKind::Device => InstanceKind::Device,
            EntityKind::DeviceMembership => InstanceKind::DeviceMembership,
        }
    }
}

/// Typed reference to an entity or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub kind: InstanceKind,
    pub id: Uuid,
}

impl InstanceRef {
    pub fn new(kind: InstanceKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// A loaded instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Instance {
    Entity(Entity),
    Channel(Channel),
}

impl Instance {
    pub fn reference(&self) -> InstanceRef {
        match self {
            Instance::Entity(entity) => InstanceRef::new(entity.kind.into(), entity.id),
            Instance::Channel(channel) => InstanceRef::new(InstanceKind::Channel, channel.id),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Instance::Entity(entity) => &entity.name,
            Instance::Channel(channel) => &channel.name,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Instance::Entity(entity) => &entity.metadata,
            Instance::Channel(channel) => &channel.metadata,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Instance::Entity(entity) => Some(entity),
            Instance::Channel(_) => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Instance::Channel(channel) => Some(channel),
            Instance::Entity(_) => None,
        }
    }
}

impl From<Entity> for Instance {
    fn from(entity: Entity) -> Self {
        Instance::Entity(entity)
    }
}

impl From<Channel> for Instance {
    fn from(channel: Channel) -> Self {
        Instance::Channel(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [
            InstanceKind::Database,
            InstanceKind::App,
            InstanceKind::Service,
            InstanceKind::Device,
            InstanceKind::DeviceMembership,
            InstanceKind::Channel,
        ] {
            assert_eq!(InstanceKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_reference_of_channel_and_entity() {
        let db = Entity::database("Home");
        let channel = Channel::new(db.id, "http://localhost:8008");

        let db_ref = Instance::from(db.clone()).reference();
        assert_eq!(db_ref, InstanceRef::new(InstanceKind::Database, db.id));

        let channel_ref = Instance::from(channel.clone()).reference();
        assert_eq!(channel_ref.kind, InstanceKind::Channel);
        assert_eq!(channel_ref.kind.entity_kind(), None);
    }
}
