//! Realizes rooms and spaces that mirror the logical entity tree.
//!
//! Database root space -> { Devices subspace -> one room per device,
//! Apps subspace -> one space per app, Services subspace -> one space per
//! service }. Every call here is idempotent: resources that already exist are
//! reported as success.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::Credentials;
use crate::error::{ReplicationError, Result, TransportError};
use crate::models::FixtureEntry;
use crate::replication::encode_fixture;
use crate::transport::{CreateRoomRequest, StateEvent, Transport};

/// State event carrying the fixture of the entity owning a space.
pub const DATABASE_STATE: &str = "f.database";
/// State event carrying the fixture of the channel a space belongs to.
pub const CHANNEL_STATE: &str = "f.database.channel";
/// State event marking a root database's Devices subspace.
pub const DEVICES_ROOT_STATE: &str = "f.database.devices";

/// Alias local part of an origin space, shared by every device creating it.
pub fn origin_alias(subject_id: &uuid::Uuid) -> String {
    format!("fractal-{}", subject_id)
}

/// Creation state seeded into a space: the owning entity and the channel.
pub fn seed_state(owner: &FixtureEntry, channel: &FixtureEntry) -> Vec<StateEvent> {
    vec![
        StateEvent::new(DATABASE_STATE, "", fixture_content(owner)),
        StateEvent::new(CHANNEL_STATE, "", fixture_content(channel)),
    ]
}

fn fixture_content(entry: &FixtureEntry) -> Value {
    let encoded = encode_fixture(std::slice::from_ref(entry));
    json!({ "fixture": encoded })
}

/// Account ids the transport accepts are lowercase.
fn check_account_id(account_id: &str) -> Result<()> {
    if account_id.chars().any(char::is_uppercase) {
        return Err(ReplicationError::config(format!(
            "account id {} must be lowercase",
            account_id
        )));
    }
    Ok(())
}

pub struct HierarchyBuilder<'a> {
    transport: &'a dyn Transport,
    session: &'a Credentials,
}

impl<'a> HierarchyBuilder<'a> {
    pub fn new(transport: &'a dyn Transport, session: &'a Credentials) -> Self {
        Self { transport, session }
    }

    /// Creates a space seeded with `state`. With an alias, a concurrent
    /// creator that got there first wins and its room id is returned.
    pub async fn create_space(
        &self,
        name: &str,
        state: Vec<StateEvent>,
        alias: Option<String>,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(ReplicationError::config("space name is required"));
        }
        let mut request = CreateRoomRequest::space(name).with_state(state);
        if let Some(alias) = &alias {
            request = request.with_alias(alias.clone());
        }

        match self.transport.create_room(self.session, request).await {
            Ok(room_id) => {
                info!(room_id = %room_id, name, "Created space");
                Ok(room_id)
            }
            Err(TransportError::AlreadyExists(existing)) => {
                let Some(alias) = alias else {
                    return Err(TransportError::AlreadyExists(existing).into());
                };
                let room_id = self.transport.resolve_alias(self.session, &alias).await?;
                debug!(room_id = %room_id, alias = %alias, "Space already exists");
                Ok(room_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a plain room and invites `invites` into it.
    pub async fn create_room(&self, name: &str, invites: Vec<String>) -> Result<String> {
        if name.is_empty() {
            return Err(ReplicationError::config("room name is required"));
        }
        for account_id in &invites {
            check_account_id(account_id)?;
        }
        let request = CreateRoomRequest::room(name).with_invites(invites);
        let room_id = self.transport.create_room(self.session, request).await?;
        info!(room_id = %room_id, name, "Created room");
        Ok(room_id)
    }

    /// Links an existing child under `parent_id`.
    pub async fn link_child(&self, parent_id: &str, child_id: &str) -> Result<()> {
        if parent_id == child_id {
            return Err(ReplicationError::config(format!(
                "cannot link {} under itself",
                child_id
            )));
        }
        match self
            .transport
            .link_child(self.session, parent_id, child_id)
            .await
        {
            Ok(()) | Err(TransportError::AlreadyExists(_)) => {
                info!(parent = parent_id, child = child_id, "Linked child");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn invite(&self, room_id: &str, account_id: &str) -> Result<()> {
        check_account_id(account_id)?;
        match self.transport.invite(self.session, room_id, account_id).await {
            Ok(()) => {
                debug!(room_id, account_id, "Invited");
                Ok(())
            }
            Err(e) if e.is_already_present() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Joins `room_id` as the builder's session.
    pub async fn join(&self, room_id: &str) -> Result<()> {
        match self.transport.join(self.session, room_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_present() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, Entity};
    use crate::transport::MemoryTransport;

    const ENDPOINT: &str = "http://localhost:8008";

    #[tokio::test]
    async fn test_link_child_rejects_self() {
        let transport = MemoryTransport::new();
        let alice = transport.login(ENDPOINT, "alice").await;
        let builder = HierarchyBuilder::new(&transport, &alice);

        let room = builder.create_space("Home", Vec::new(), None).await.unwrap();
        let err = builder.link_child(&room, &room).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Configuration(_)));
        assert!(transport.children(&room).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_space_with_alias_converges() {
        let transport = MemoryTransport::new();
        let alice = transport.login(ENDPOINT, "alice").await;
        let builder = HierarchyBuilder::new(&transport, &alice);
        let alias = origin_alias(&uuid::Uuid::new_v4());

        let first = builder
            .create_space("Home", Vec::new(), Some(alias.clone()))
            .await
            .unwrap();
        let second = builder
            .create_space("Home", Vec::new(), Some(alias))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_seed_state_carries_fixtures() {
        let transport = MemoryTransport::new();
        let alice = transport.login(ENDPOINT, "alice").await;
        let builder = HierarchyBuilder::new(&transport, &alice);
        let db = Entity::database("Home");
        let channel = Channel::new(db.id, ENDPOINT).with_origin(true);

        let state = seed_state(&db.to_fixture().unwrap(), &channel.to_fixture().unwrap());
        let room = builder.create_space("Home", state, None).await.unwrap();

        let seeded = transport.state(&room, DATABASE_STATE, "").await.unwrap();
        assert_eq!(seeded["fixture"][0]["pk"], json!(db.id.to_string()));
        assert!(transport.state(&room, CHANNEL_STATE, "").await.is_some());
    }

    #[tokio::test]
    async fn test_uppercase_invite_is_configuration_error() {
        let transport = MemoryTransport::new();
        let alice = transport.login(ENDPOINT, "alice").await;
        let builder = HierarchyBuilder::new(&transport, &alice);
        let room = builder.create_room("Laptop", Vec::new()).await.unwrap();

        let err = builder.invite(&room, "@Laptop:localhost").await.unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration(_)));

        let err = builder
            .create_room("Laptop", vec!["@Laptop:localhost".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_invite_of_member_is_success() {
        let transport = MemoryTransport::new();
        let alice = transport.login(ENDPOINT, "alice").await;
        let builder = HierarchyBuilder::new(&transport, &alice);
        let room = builder.create_room("Laptop", Vec::new()).await.unwrap();

        builder.invite(&room, &alice.identity).await.unwrap();
        builder.join(&room).await.unwrap();
    }
}
