use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{CreateRoomRequest, Event, EventBatch, StateEvent, Transport, Visibility, SPACE_CHILD_EVENT};
use crate::context::Credentials;
use crate::error::TransportError;

struct Room {
    name: String,
    space: bool,
    visibility: Visibility,
    members: BTreeSet<String>,
    invited: BTreeSet<String>,
    state: HashMap<(String, String), Value>,
    timeline: Vec<Event>,
}

#[derive(Default)]
struct Account {
    display_name: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    rooms: HashMap<String, Room>,
    aliases: HashMap<String, String>,
    tokens: HashMap<String, String>,
    accounts: HashMap<String, Account>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn account_for(&self, session: &Credentials) -> Result<String, TransportError> {
        self.tokens
            .get(&session.access_token)
            .cloned()
            .ok_or_else(|| TransportError::Unauthorized("unknown access token".to_string()))
    }

    fn room(&self, room_id: &str) -> Result<&Room, TransportError> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| TransportError::NotFound(room_id.to_string()))
    }

    fn joined_room_mut(&mut self, room_id: &str, account: &str) -> Result<&mut Room, TransportError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| TransportError::NotFound(room_id.to_string()))?;
        if !room.members.contains(account) {
            return Err(TransportError::Unauthorized(format!(
                "{} is not in {}",
                account, room_id
            )));
        }
        Ok(room)
    }

    fn new_account(&mut self, account_id: String) -> String {
        let token = format!("token_{}", self.next_id());
        self.tokens.insert(token.clone(), account_id.clone());
        self.accounts.entry(account_id).or_default();
        token
    }
}

/// Host part of an endpoint URL, used as the server name of its ids.
fn endpoint_server(endpoint: &str) -> String {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    without_scheme.trim_end_matches('/').to_string()
}

/// In-process transport serving any number of endpoints.
///
/// Rooms are append-only timelines plus a state map; long polls park on a
/// [`Notify`] until an event arrives or the timeout passes.
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or reuses) a user account on `endpoint` and returns a session
    /// for it.
    pub async fn login(&self, endpoint: &str, username: &str) -> Credentials {
        let mut inner = self.inner.lock().await;
        let account_id = format!("@{}:{}", username, endpoint_server(endpoint));
        let token = inner.new_account(account_id.clone());
        Credentials::new(token, endpoint, account_id)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }

    /// Accounts on every endpoint, logged-in users included.
    pub async fn account_count(&self) -> usize {
        self.inner.lock().await.accounts.len()
    }

    pub async fn room_name(&self, room_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.rooms.get(room_id).map(|room| room.name.clone())
    }

    pub async fn is_space(&self, room_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.rooms.get(room_id).map(|room| room.space).unwrap_or(false)
    }

    /// Rooms linked under `room_id` as space children.
    pub async fn children(&self, room_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        let mut children: Vec<_> = room
            .state
            .keys()
            .filter(|(event_type, _)| event_type == SPACE_CHILD_EVENT)
            .map(|(_, key)| key.clone())
            .collect();
        children.sort();
        children
    }

    pub async fn state(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner
            .rooms
            .get(room_id)
            .and_then(|room| room.state.get(&(event_type.to_string(), state_key.to_string())))
            .cloned()
    }

    pub async fn members(&self, room_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .rooms
            .get(room_id)
            .map(|room| room.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn display_name(&self, account_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .get(account_id)
            .and_then(|account| account.display_name.clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_room(
        &self,
        session: &Credentials,
        request: CreateRoomRequest,
    ) -> Result<String, TransportError> {
        let mut inner = self.inner.lock().await;
        let creator = inner.account_for(session)?;
        let server = endpoint_server(&session.endpoint);

        let alias_key = request
            .alias
            .as_ref()
            .map(|alias| format!("#{}:{}", alias, server));
        if let Some(key) = &alias_key {
            if inner.aliases.contains_key(key) {
                return Err(TransportError::AlreadyExists(key.clone()));
            }
        }

        let room_id = format!("!r{}:{}", inner.next_id(), server);
        let mut state = HashMap::new();
        for event in request.initial_state {
            state.insert((event.event_type, event.state_key), event.content);
        }
        let room = Room {
            name: request.name,
            space: request.space,
            visibility: request.visibility,
            members: BTreeSet::from([creator]),
            invited: request.invite.into_iter().collect(),
            state,
            timeline: Vec::new(),
        };
        inner.rooms.insert(room_id.clone(), room);
        if let Some(key) = alias_key {
            inner.aliases.insert(key, room_id.clone());
        }
        Ok(room_id)
    }

    async fn resolve_alias(
        &self,
        session: &Credentials,
        alias: &str,
    ) -> Result<String, TransportError> {
        let inner = self.inner.lock().await;
        let key = format!("#{}:{}", alias, endpoint_server(&session.endpoint));
        inner
            .aliases
            .get(&key)
            .cloned()
            .ok_or(TransportError::NotFound(key))
    }

    async fn put_state(
        &self,
        session: &Credentials,
        room_id: &str,
        event: StateEvent,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_for(session)?;
        let room = inner.joined_room_mut(room_id, &account)?;
        room.state
            .insert((event.event_type, event.state_key), event.content);
        Ok(())
    }

    async fn get_state(
        &self,
        session: &Credentials,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, TransportError> {
        let inner = self.inner.lock().await;
        inner.account_for(session)?;
        let room = inner.room(room_id)?;
        Ok(room
            .state
            .get(&(event_type.to_string(), state_key.to_string()))
            .cloned())
    }

    async fn invite(
        &self,
        session: &Credentials,
        room_id: &str,
        account_id: &str,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_for(session)?;
        if !inner.accounts.contains_key(account_id) {
            return Err(TransportError::NotFound(account_id.to_string()));
        }
        let room = inner.joined_room_mut(room_id, &account)?;
        if room.members.contains(account_id) {
            return Err(TransportError::AlreadyJoined(format!(
                "{} is already in the room",
                account_id
            )));
        }
        room.invited.insert(account_id.to_string());
        Ok(())
    }

    async fn join(&self, session: &Credentials, room_id: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_for(session)?;
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| TransportError::NotFound(room_id.to_string()))?;
        if room.members.contains(&account) {
            return Ok(());
        }
        if !room.invited.remove(&account) && room.visibility != Visibility::Public {
            return Err(TransportError::Unauthorized(format!(
                "{} was not invited to {}",
                account, room_id
            )));
        }
        room.members.insert(account);
        Ok(())
    }

    async fn register_account(
        &self,
        session: &Credentials,
        username: &str,
        _password: &str,
    ) -> Result<Credentials, TransportError> {
        let mut inner = self.inner.lock().await;
        inner.account_for(session)?;
        let account_id = format!("@{}:{}", username, endpoint_server(&session.endpoint));
        if inner.accounts.contains_key(&account_id) {
            return Err(TransportError::AlreadyExists(account_id));
        }
        let token = inner.new_account(account_id.clone());
        Ok(Credentials::new(token, session.endpoint.clone(), account_id))
    }

    async fn set_display_name(
        &self,
        session: &Credentials,
        display_name: &str,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_for(session)?;
        inner.accounts.entry(account).or_default().display_name = Some(display_name.to_string());
        Ok(())
    }

    async fn send_event(
        &self,
        session: &Credentials,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, TransportError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_for(session)?;
        let event_id = format!("$e{}", inner.next_id());
        let room = inner.joined_room_mut(room_id, &account)?;
        let cursor = (room.timeline.len() + 1).to_string();
        room.timeline.push(Event {
            event_id: event_id.clone(),
            room_id: room_id.to_string(),
            sender: account,
            event_type: event_type.to_string(),
            content,
            cursor,
        });
        drop(inner);
        self.notify.notify_waiters();
        Ok(event_id)
    }

    async fn fetch_events(
        &self,
        session: &Credentials,
        room_id: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<EventBatch, TransportError> {
        let position: usize = match since {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| TransportError::Request(format!("invalid cursor {}", cursor)))?,
            None => 0,
        };
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                let account = inner.account_for(session)?;
                let room = inner.joined_room_mut(room_id, &account)?;
                if room.timeline.len() > position {
                    let events = room.timeline[position..].to_vec();
                    return Ok(EventBatch {
                        next_cursor: Some(room.timeline.len().to_string()),
                        events,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(EventBatch {
                    events: Vec::new(),
                    next_cursor: since.map(str::to_string),
                });
            }
        }
    }

    async fn head_cursor(
        &self,
        session: &Credentials,
        room_id: &str,
    ) -> Result<Option<String>, TransportError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_for(session)?;
        let room = inner.joined_room_mut(room_id, &account)?;
        if room.timeline.is_empty() {
            Ok(None)
        } else {
            Ok(Some(room.timeline.len().to_string()))
        }
    }
}
