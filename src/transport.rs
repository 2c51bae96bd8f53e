//! Matrix client-server implementation of [`Transport`].
//!
//! Timeline cursors have the form `<token>|<skip>`: a `/messages` pagination
//! token plus the number of events after it that were already handed out, so
//! every event carries its own resume point.

use async_trait::async_trait;
use fractal_core::transport::{
    server_name, CreateRoomRequest, Event, EventBatch, StateEvent, Transport, Visibility,
};
use fractal_core::{Credentials, TransportError};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const API_PREFIX: &str = "/_matrix/client/v3";
const PAGE_LIMIT: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct MatrixError {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    user_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    start: String,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    chunk: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event_id: String,
    #[serde(default)]
    sender: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: Value,
}

/// Splits a `<token>|<skip>` cursor.
fn parse_cursor(cursor: &str) -> Result<(&str, usize), TransportError> {
    let (token, skip) = cursor
        .rsplit_once('|')
        .ok_or_else(|| TransportError::Request(format!("invalid cursor {}", cursor)))?;
    let skip = skip
        .parse()
        .map_err(|_| TransportError::Request(format!("invalid cursor {}", cursor)))?;
    Ok((token, skip))
}

fn cursor(token: &str, skip: usize) -> String {
    format!("{}|{}", token, skip)
}

/// Events of `page` past the first `skip`, and the cursor to read from next.
///
/// Event cursors index into the page fetched from `base`. The next cursor
/// moves on to the page's `end` token whenever the server returns one, so a
/// skip never outgrows one page.
fn read_page(room_id: &str, base: &str, skip: usize, page: MessagesResponse) -> (Vec<Event>, String) {
    let total = page.chunk.len();
    let events = page
        .chunk
        .into_iter()
        .enumerate()
        .skip(skip)
        .map(|(index, raw)| Event {
            event_id: raw.event_id,
            room_id: room_id.to_string(),
            sender: raw.sender,
            event_type: raw.event_type,
            content: raw.content,
            cursor: cursor(base, index + 1),
        })
        .collect();
    let next = match page.end {
        Some(end) if !(total == 0 && end == base) => cursor(&end, 0),
        _ => cursor(base, total.max(skip)),
    };
    (events, next)
}

/// Maps a failed response to the transport error taxonomy.
fn classify(status: StatusCode, body: &str) -> TransportError {
    let parsed: Option<MatrixError> = serde_json::from_str(body).ok();
    let (errcode, message) = parsed
        .map(|e| (e.errcode, e.error))
        .unwrap_or_else(|| (String::new(), body.to_string()));

    if errcode == "M_ROOM_IN_USE" || errcode == "M_USER_IN_USE" {
        TransportError::AlreadyExists(message)
    } else if message.contains("is already in the room") {
        TransportError::AlreadyJoined(message)
    } else if status == StatusCode::NOT_FOUND || errcode == "M_NOT_FOUND" {
        TransportError::NotFound(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TransportError::Unauthorized(format!("{} {}", errcode, message))
    } else {
        TransportError::Request(format!("{} {}: {}", status, errcode, message))
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    poll_interval: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}{}", endpoint.trim_end_matches('/'), API_PREFIX, path)
    }

    async fn request(
        &self,
        method: Method,
        session: &Credentials,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let url = Self::url(&session.endpoint, path);
        let mut request = self.client.request(method.clone(), &url).query(query);
        if !session.access_token.is_empty() {
            request = request.bearer_auth(&session.access_token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if !status.is_success() {
            let error = classify(status, &text);
            debug!(%method, path, %status, error = %error, "Matrix request failed");
            return Err(error);
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Request(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, TransportError> {
        serde_json::from_value(value).map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn messages(
        &self,
        session: &Credentials,
        room_id: &str,
        from: Option<&str>,
        limit: usize,
    ) -> Result<MessagesResponse, TransportError> {
        let mut query = vec![("dir", "f".to_string()), ("limit", limit.to_string())];
        if let Some(from) = from {
            query.push(("from", from.to_string()));
        }
        let path = format!("/rooms/{}/messages", urlencoding::encode(room_id));
        let value = self
            .request(Method::GET, session, &path, &query, None)
            .await?;
        Self::decode(value)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_room(
        &self,
        session: &Credentials,
        request: CreateRoomRequest,
    ) -> Result<String, TransportError> {
        let initial_state: Vec<Value> = request
            .initial_state
            .iter()
            .map(|event| {
                json!({
                    "type": event.event_type,
                    "state_key": event.state_key,
                    "content": event.content,
                })
            })
            .collect();
        let visibility = match request.visibility {
            Visibility::Public => "public",
            Visibility::Private => "private",
        };
        let mut body = json!({
            "name": request.name,
            "visibility": visibility,
            "preset": "private_chat",
            "initial_state": initial_state,
            "invite": request.invite,
        });
        if request.space {
            body["creation_content"] = json!({ "type": "m.space" });
        }
        if let Some(alias) = &request.alias {
            body["room_alias_name"] = json!(alias);
        }

        let value = self
            .request(Method::POST, session, "/createRoom", &[], Some(body))
            .await?;
        Ok(Self::decode::<RoomIdResponse>(value)?.room_id)
    }

    async fn resolve_alias(&self, session: &Credentials, alias: &str) -> Result<String, TransportError> {
        let server = server_name(&session.identity).ok_or_else(|| {
            TransportError::Request(format!("session {} has no server name", session.identity))
        })?;
        let full = format!("#{}:{}", alias, server);
        let path = format!("/directory/room/{}", urlencoding::encode(&full));
        let value = self.request(Method::GET, session, &path, &[], None).await?;
        Ok(Self::decode::<RoomIdResponse>(value)?.room_id)
    }

    async fn put_state(
        &self,
        session: &Credentials,
        room_id: &str,
        event: StateEvent,
    ) -> Result<(), TransportError> {
        let path = format!(
            "/rooms/{}/state/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(&event.event_type),
            urlencoding::encode(&event.state_key)
        );
        self.request(Method::PUT, session, &path, &[], Some(event.content))
            .await?;
        Ok(())
    }

    async fn get_state(
        &self,
        session: &Credentials,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, TransportError> {
        let path = format!(
            "/rooms/{}/state/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_type),
            urlencoding::encode(state_key)
        );
        match self.request(Method::GET, session, &path, &[], None).await {
            Ok(value) => Ok(Some(value)),
            Err(TransportError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn invite(
        &self,
        session: &Credentials,
        room_id: &str,
        account_id: &str,
    ) -> Result<(), TransportError> {
        let path = format!("/rooms/{}/invite", urlencoding::encode(room_id));
        self.request(
            Method::POST,
            session,
            &path,
            &[],
            Some(json!({ "user_id": account_id })),
        )
        .await?;
        Ok(())
    }

    async fn join(&self, session: &Credentials, room_id: &str) -> Result<(), TransportError> {
        let path = format!("/join/{}", urlencoding::encode(room_id));
        self.request(Method::POST, session, &path, &[], Some(json!({})))
            .await?;
        Ok(())
    }

    async fn register_account(
        &self,
        session: &Credentials,
        username: &str,
        password: &str,
    ) -> Result<Credentials, TransportError> {
        let body = json!({
            "username": username,
            "password": password,
            "auth": { "type": "m.login.dummy" },
            "inhibit_login": false,
        });
        let value = self
            .request(Method::POST, session, "/register", &[], Some(body))
            .await?;
        let registered: RegisterResponse = Self::decode(value)?;
        Ok(Credentials::new(
            registered.access_token,
            session.endpoint.clone(),
            registered.user_id,
        ))
    }

    async fn set_display_name(
        &self,
        session: &Credentials,
        display_name: &str,
    ) -> Result<(), TransportError> {
        let path = format!(
            "/profile/{}/displayname",
            urlencoding::encode(&session.identity)
        );
        self.request(
            Method::PUT,
            session,
            &path,
            &[],
            Some(json!({ "displayname": display_name })),
        )
        .await?;
        Ok(())
    }

    async fn send_event(
        &self,
        session: &Credentials,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, TransportError> {
        let path = format!(
            "/rooms/{}/send/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_type),
            Uuid::new_v4()
        );
        let value = self
            .request(Method::PUT, session, &path, &[], Some(content))
            .await?;
        Ok(Self::decode::<EventIdResponse>(value)?.event_id)
    }

    async fn fetch_events(
        &self,
        session: &Credentials,
        room_id: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<EventBatch, TransportError> {
        let mut position = match since {
            Some(since) => {
                let (token, skip) = parse_cursor(since)?;
                Some((token.to_string(), skip))
            }
            None => None,
        };
        let deadline = Instant::now() + timeout;

        loop {
            let from = position.as_ref().map(|(token, _)| token.as_str());
            let skip = position.as_ref().map_or(0, |(_, skip)| *skip);
            let page = self.messages(session, room_id, from, PAGE_LIMIT).await?;
            let base = from.map_or_else(|| page.start.clone(), str::to_string);

            let (events, next_cursor) = read_page(room_id, &base, skip, page);
            if !events.is_empty() {
                return Ok(EventBatch {
                    events,
                    next_cursor: Some(next_cursor),
                });
            }

            // Everything on this page was already seen; move past it.
            if next_cursor != cursor(&base, skip) {
                let (token, skip) = parse_cursor(&next_cursor)?;
                position = Some((token.to_string(), skip));
                if Instant::now() < deadline {
                    continue;
                }
            }

            if Instant::now() + self.poll_interval >= deadline {
                return Ok(EventBatch {
                    events: Vec::new(),
                    next_cursor: position.map(|(token, skip)| cursor(&token, skip)),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn head_cursor(
        &self,
        session: &Credentials,
        room_id: &str,
    ) -> Result<Option<String>, TransportError> {
        let path = format!("/rooms/{}/messages", urlencoding::encode(room_id));
        let query = [("dir", "b".to_string()), ("limit", "1".to_string())];
        let value = self.request(Method::GET, session, &path, &query, None).await?;
        let page: MessagesResponse = Self::decode(value)?;
        Ok(Some(cursor(&page.start, 0)))
    }
}
