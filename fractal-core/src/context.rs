//! Explicit acting context threaded through every plan and run call.

use uuid::Uuid;

use crate::error::{ReplicationError, Result};

/// Opaque session for one transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub endpoint: String,
    /// Account id the session acts as, e.g. `@alice:localhost`.
    pub identity: String,
}

impl Credentials {
    pub fn new(
        access_token: impl Into<String>,
        endpoint: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            endpoint: endpoint.into(),
            identity: identity.into(),
        }
    }
}

/// The device and database a worker acts for, with the user's sessions on
/// each endpoint it is logged in to.
#[derive(Debug, Clone)]
pub struct ReplicationContext {
    pub device_id: Uuid,
    pub database_id: Uuid,
    pub sessions: Vec<Credentials>,
}

impl ReplicationContext {
    pub fn new(device_id: Uuid, database_id: Uuid) -> Self {
        Self {
            device_id,
            database_id,
            sessions: Vec::new(),
        }
    }

    /// Adds a session, replacing any earlier one for the same endpoint.
    pub fn with_session(mut self, credentials: Credentials) -> Self {
        self.sessions.retain(|s| s.endpoint != credentials.endpoint);
        self.sessions.push(credentials);
        self
    }

    /// The user's session on `endpoint`, or `AuthenticationRequired`.
    pub fn session_for(&self, endpoint: &str) -> Result<&Credentials> {
        self.sessions
            .iter()
            .find(|s| s.endpoint == endpoint)
            .ok_or_else(|| {
                ReplicationError::AuthenticationRequired(format!(
                    "not logged in to {}",
                    endpoint
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lookup_by_endpoint() {
        let ctx = ReplicationContext::new(Uuid::new_v4(), Uuid::new_v4())
            .with_session(Credentials::new("a", "http://a", "@alice:a"))
            .with_session(Credentials::new("b", "http://b", "@alice:b"))
            .with_session(Credentials::new("a2", "http://a", "@alice:a"));

        assert_eq!(ctx.session_for("http://a").unwrap().access_token, "a2");
        assert_eq!(ctx.session_for("http://b").unwrap().access_token, "b");
        assert!(matches!(
            ctx.session_for("http://c"),
            Err(ReplicationError::AuthenticationRequired(_))
        ));
    }
}
