use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::fixture::FixtureEntry;
use super::metadata::{Metadata, APPS_ROOM_ID, ROOM_ID, SERVICES_ROOM_ID};

/// The closed set of logical node types that can be replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Database,
    App,
    Service,
    Device,
    DeviceMembership,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Database,
        EntityKind::App,
        EntityKind::Service,
        EntityKind::Device,
        EntityKind::DeviceMembership,
    ];

    /// Model name used in fixtures.
    pub fn model_name(&self) -> &'static str {
        match self {
            EntityKind::Database => "fractal.database",
            EntityKind::App => "fractal.app",
            EntityKind::Service => "fractal.service",
            EntityKind::Device => "fractal.device",
            EntityKind::DeviceMembership => "fractal.devicemembership",
        }
    }

    pub fn from_model_name(model: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.model_name() == model)
    }

    /// Databases, apps and services each own a root space on a channel.
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            EntityKind::Database | EntityKind::App | EntityKind::Service
        )
    }

    /// Type tags carried by this kind. An app is also a service.
    pub fn type_tags(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Database => &["database"],
            EntityKind::Service => &["database", "service"],
            EntityKind::App => &["database", "service", "app"],
            EntityKind::Device => &["device"],
            EntityKind::DeviceMembership => &["membership"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model_name())
    }
}

/// Namespace of a channel's root space that a nested structure is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Root,
    Services,
    Apps,
}

impl Namespace {
    /// Picks the namespace from type tags: apps win over services, anything
    /// untagged lands in the root.
    pub fn for_tags(tags: &[&str]) -> Self {
        if tags.contains(&"app") {
            Namespace::Apps
        } else if tags.contains(&"service") {
            Namespace::Services
        } else {
            Namespace::Root
        }
    }

    /// Channel metadata label holding this namespace's room id.
    pub fn metadata_label(&self) -> &'static str {
        match self {
            Namespace::Root => ROOM_ID,
            Namespace::Services => SERVICES_ROOM_ID,
            Namespace::Apps => APPS_ROOM_ID,
        }
    }
}

/// A replicated logical node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub kind: EntityKind,
    pub name: String,
    /// Owning database for apps, services and memberships.
    pub parent_id: Option<Uuid>,
    /// Member device for memberships.
    pub device_id: Option<Uuid>,
    /// Account identity of a device's owner.
    pub owner_id: Option<String>,
    pub object_version: u64,
    pub deleted: bool,
    pub metadata: Metadata,
    pub date_modified: DateTime<Utc>,
}

impl Entity {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            parent_id: None,
            device_id: None,
            owner_id: None,
            object_version: 0,
            deleted: false,
            metadata: Metadata::new(),
            date_modified: Utc::now(),
        }
    }

    pub fn database(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Database, name)
    }

    pub fn app(name: impl Into<String>, parent: &Entity) -> Self {
        Self::new(EntityKind::App, name).with_parent(parent.id)
    }

    pub fn service(name: impl Into<String>, parent: &Entity) -> Self {
        Self::new(EntityKind::Service, name).with_parent(parent.id)
    }

    pub fn device(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Device, name)
    }

    /// Membership of `device` in `database`.
    pub fn membership(device: &Entity, database: &Entity) -> Self {
        let mut membership = Self::new(
            EntityKind::DeviceMembership,
            format!("{} in {}", device.name, database.name),
        )
        .with_parent(database.id);
        membership.device_id = Some(device.id);
        membership
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Records a local modification. Versions only ever move forward.
    pub fn touch(&mut self) {
        self.object_version += 1;
        self.date_modified = Utc::now();
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::for_tags(self.kind.type_tags())
    }

    pub fn room_id(&self) -> Option<&str> {
        self.metadata.get_str(ROOM_ID)
    }

    pub fn to_fixture(&self) -> Result<FixtureEntry, serde_json::Error> {
        FixtureEntry::from_record(self.kind.model_name(), self)
    }

    pub fn from_fixture(entry: &FixtureEntry) -> Result<Self, serde_json::Error> {
        entry.to_record()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' ({})", self.kind, self.name, self.id)
    }
}
