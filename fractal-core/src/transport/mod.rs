//! The broadcast-log transport: rooms, spaces, state and timelines.

mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::context::Credentials;
use crate::error::TransportError;

/// State event type linking a child room into a space.
pub const SPACE_CHILD_EVENT: &str = "m.space.child";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// A state event keyed by `(event_type, state_key)`. Writes with the same key
/// replace each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

impl StateEvent {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
            content,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRoomRequest {
    pub name: String,
    pub space: bool,
    pub initial_state: Vec<StateEvent>,
    pub visibility: Visibility,
    /// Local part of an alias to claim; creation fails with `AlreadyExists`
    /// when another room holds it.
    pub alias: Option<String>,
    pub invite: Vec<String>,
}

impl CreateRoomRequest {
    pub fn space(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            space: true,
            ..Default::default()
        }
    }

    pub fn room(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: Vec<StateEvent>) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_invites(mut self, invite: Vec<String>) -> Self {
        self.invite = invite;
        self
    }
}

/// A timeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    pub content: Value,
    /// Resume point that skips this event and everything before it.
    pub cursor: String,
}

/// Result of one fetch. An empty batch keeps `next_cursor` at the request's
/// cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub next_cursor: Option<String>,
}

/// Server part of an account or room id (`@name:server` -> `server`).
pub fn server_name(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, server)| server).filter(|s| !s.is_empty())
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_room(
        &self,
        session: &Credentials,
        request: CreateRoomRequest,
    ) -> Result<String, TransportError>;

    /// Room currently holding the alias local part.
    async fn resolve_alias(&self, session: &Credentials, alias: &str)
        -> Result<String, TransportError>;

    async fn put_state(
        &self,
        session: &Credentials,
        room_id: &str,
        event: StateEvent,
    ) -> Result<(), TransportError>;

    async fn get_state(
        &self,
        session: &Credentials,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, TransportError>;

    async fn invite(
        &self,
        session: &Credentials,
        room_id: &str,
        account_id: &str,
    ) -> Result<(), TransportError>;

    async fn join(&self, session: &Credentials, room_id: &str) -> Result<(), TransportError>;

    /// Registers a new account on the session's server.
    async fn register_account(
        &self,
        session: &Credentials,
        username: &str,
        password: &str,
    ) -> Result<Credentials, TransportError>;

    async fn set_display_name(
        &self,
        session: &Credentials,
        display_name: &str,
    ) -> Result<(), TransportError>;

    /// Appends an event to a room's timeline and returns its id.
    async fn send_event(
        &self,
        session: &Credentials,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, TransportError>;

    /// Events after `since` (from the start when `None`). Waits up to
    /// `timeout` for something to arrive, then returns an empty batch.
    async fn fetch_events(
        &self,
        session: &Credentials,
        room_id: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<EventBatch, TransportError>;

    /// Cursor positioned after the newest event, `None` for an empty room.
    async fn head_cursor(
        &self,
        session: &Credentials,
        room_id: &str,
    ) -> Result<Option<String>, TransportError>;

    /// Links `child_id` under the space `parent_id`.
    async fn link_child(
        &self,
        session: &Credentials,
        parent_id: &str,
        child_id: &str,
    ) -> Result<(), TransportError> {
        let via: Vec<&str> = server_name(child_id).into_iter().collect();
        self.put_state(
            session,
            parent_id,
            StateEvent::new(SPACE_CHILD_EVENT, child_id, json!({ "via": via })),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name() {
        assert_eq!(server_name("@alice:localhost"), Some("localhost"));
        assert_eq!(server_name("!abc:example.org"), Some("example.org"));
        assert_eq!(server_name("alice"), None);
        assert_eq!(server_name("alice:"), None);
    }
}
