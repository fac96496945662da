use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use dashmap::DashMap;

use boardsync_core::UserId;

pub const SESSION_COOKIE: &str = "session";

/// Who a session token belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub is_admin: bool,
}

/// Identity collaborator: turns a session cookie into a user.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn lookup(&self, token: &str) -> Option<SessionIdentity>;
}

/// In-process session table, filled at startup or by tests.
#[derive(Default)]
pub struct StaticSessions {
    sessions: DashMap<String, SessionIdentity>,
}

impl StaticSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: UserId, is_admin: bool) {
        self.sessions
            .insert(token.into(), SessionIdentity { user_id, is_admin });
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionLookup for StaticSessions {
    async fn lookup(&self, token: &str) -> Option<SessionIdentity> {
        self.sessions.get(token).map(|s| s.clone())
    }
}

/// Value of the `session` cookie, if any.
pub fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

pub async fn resolve(lookup: &dyn SessionLookup, headers: &HeaderMap) -> Option<SessionIdentity> {
    let token = session_token(headers)?;
    lookup.lookup(token).await
}
