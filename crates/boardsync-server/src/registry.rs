//! Authoritative connection state.
//!
//! Three maps: connection records, a board index and a user index. Each map
//! operation is atomic on its own; sequences spanning maps are not, and no
//! code path holds a guard on one map while touching another. The per-user
//! cap is checked then inserted in two steps, so two concurrent admissions
//! for the same user can both pass. That slack is accepted: the cap is an
//! abuse limit, not an invariant the rest of the system relies on.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use boardsync_core::{BoardId, ConnectionId, UserId};

use crate::error::RegistryError;
use crate::sink::EventSink;

/// One open stream.
pub struct Connection {
    pub id: ConnectionId,
    pub sink: Arc<dyn EventSink>,
    pub user_id: Option<UserId>,
    pub board_id: Option<BoardId>,
    pub connected_at: DateTime<Utc>,
    /// Last successful write or join.
    pub last_seen: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("board_id", &self.board_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a connection for the admin surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_id: ConnectionId,
    pub user_id: Option<UserId>,
    pub board_id: Option<BoardId>,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}

impl ConnectionInfo {
    fn of(conn: &Connection, now: Instant) -> Self {
        Self {
            client_id: conn.id.clone(),
            user_id: conn.user_id.clone(),
            board_id: conn.board_id.clone(),
            connected_at: conn.connected_at,
            idle_ms: now.saturating_duration_since(conn.last_seen).as_millis() as u64,
        }
    }
}

pub struct ConnectionRegistry {
    pub(crate) connections: DashMap<ConnectionId, Connection>,
    boards: DashMap<BoardId, HashSet<ConnectionId>>,
    users: DashMap<UserId, HashSet<ConnectionId>>,
    /// Last presence ping per user on a board, shared by all of the user's tabs.
    pub(crate) last_pings: DashMap<(BoardId, UserId), Instant>,
    max_connections_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections_per_user: usize) -> Self {
        Self {
            connections: DashMap::new(),
            boards: DashMap::new(),
            users: DashMap::new(),
            last_pings: DashMap::new(),
            max_connections_per_user,
        }
    }

    pub fn max_connections_per_user(&self) -> usize {
        self.max_connections_per_user
    }

    /// Store a new connection, indexing it by user and (if given) board.
    pub fn admit(
        &self,
        id: ConnectionId,
        sink: Arc<dyn EventSink>,
        user_id: Option<UserId>,
        board_id: Option<BoardId>,
    ) -> Result<(), RegistryError> {
        if let Some(user) = &user_id {
            self.check_cap(user)?;
        }

        let now = Instant::now();
        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                sink,
                user_id: user_id.clone(),
                board_id: board_id.clone(),
                connected_at: Utc::now(),
                last_seen: now,
            },
        );
        if let Some(user) = &user_id {
            index(&self.users, user, &id);
        }
        if let Some(board) = &board_id {
            index(&self.boards, board, &id);
        }

        info!(
            connection_id = %id,
            user_id = user_id.as_ref().map(|u| u.as_str()),
            board_id = board_id.as_ref().map(|b| b.as_str()),
            "connection admitted"
        );
        Ok(())
    }

    /// Move a connection onto `board_id`, optionally attaching a user.
    /// Returns `Ok(false)` for an unknown connection. Repeat calls are no-ops.
    /// Attaching a user counts against that user's cap like an admission.
    pub fn join(
        &self,
        id: &ConnectionId,
        board_id: BoardId,
        user_id: Option<UserId>,
    ) -> Result<bool, RegistryError> {
        let Some(current_user) = self.connections.get(id).map(|c| c.user_id.clone()) else {
            return Ok(false);
        };
        if let Some(user) = user_id.as_ref().filter(|u| current_user.as_ref() != Some(*u)) {
            self.check_cap(user)?;
        }

        let (old_board, old_user, user) = {
            let Some(mut conn) = self.connections.get_mut(id) else {
                return Ok(false);
            };
            conn.last_seen = Instant::now();
            let old_board = conn.board_id.replace(board_id.clone());
            let old_user = match &user_id {
                Some(user) if conn.user_id.as_ref() != Some(user) => {
                    Some(conn.user_id.replace(user.clone()))
                }
                _ => None,
            };
            (old_board, old_user, conn.user_id.clone())
        };

        if old_board.as_ref() != Some(&board_id) {
            if let Some(old) = &old_board {
                unindex(&self.boards, old, id);
            }
            index(&self.boards, &board_id, id);
        }
        if let Some(previous) = old_user {
            if let Some(previous) = &previous {
                unindex(&self.users, previous, id);
            }
            if let Some(user) = &user {
                index(&self.users, user, id);
            }
        }

        // A concurrent remove may have unindexed before the inserts above.
        if !self.connections.contains_key(id) {
            unindex(&self.boards, &board_id, id);
            if let Some(user) = &user {
                unindex(&self.users, user, id);
            }
            return Ok(false);
        }

        if old_board.as_ref() != Some(&board_id) {
            debug!(connection_id = %id, board_id = %board_id, "connection joined board");
        }
        Ok(true)
    }

    fn check_cap(&self, user: &UserId) -> Result<(), RegistryError> {
        let held = self.user_connection_count(user);
        if held >= self.max_connections_per_user {
            warn!(
                user_id = %user,
                held,
                limit = self.max_connections_per_user,
                "connection limit exceeded"
            );
            return Err(RegistryError::AdmissionRejected {
                user_id: user.clone(),
                limit: self.max_connections_per_user,
            });
        }
        Ok(())
    }

    /// Drop a connection's board membership but keep the connection.
    /// Returns the board it left.
    pub fn leave(&self, id: &ConnectionId) -> Option<BoardId> {
        let board = self.connections.get_mut(id)?.board_id.take()?;
        unindex(&self.boards, &board, id);
        debug!(connection_id = %id, board_id = %board, "connection left board");
        Some(board)
    }

    /// Remove a connection from every map and close its sink.
    /// Returns the removed record; `None` if it was already gone.
    pub fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        let (_, conn) = self.connections.remove(id)?;
        if let Some(board) = &conn.board_id {
            unindex(&self.boards, board, id);
        }
        if let Some(user) = &conn.user_id {
            unindex(&self.users, user, id);
        }
        conn.sink.close();
        info!(connection_id = %id, "connection removed");
        Some(conn)
    }

    /// Remove every connection. Used at shutdown so open streams end.
    pub fn drain(&self) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove connections with no successful write for longer than `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<Connection> {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|e| e.key().clone())
            .collect();
        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let now = Instant::now();
        self.connections.get(id).map(|c| ConnectionInfo::of(&c, now))
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut all: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|e| ConnectionInfo::of(e.value(), now))
            .collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    /// Ids indexed under the board right now. Callers iterate this copy.
    pub fn board_connections(&self, board_id: &BoardId) -> Vec<ConnectionId> {
        self.boards
            .get(board_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_connections(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.users.get(user_id).map(|set| set.len()).unwrap_or(0)
    }

    /// `(user, connection)` pairs for every identified connection on the board.
    pub fn connected_users(&self, board_id: &BoardId) -> Vec<(UserId, ConnectionId)> {
        self.board_connections(board_id)
            .into_iter()
            .filter_map(|id| {
                let conn = self.connections.get(&id)?;
                let user = conn.user_id.clone()?;
                Some((user, id))
            })
            .collect()
    }

    /// Distinct identified users on the board.
    pub fn active_user_count(&self, board_id: &BoardId) -> usize {
        self.connected_users(board_id)
            .into_iter()
            .map(|(user, _)| user)
            .collect::<HashSet<_>>()
            .len()
    }

    /// True if no connection other than `excluding` ties `user_id` to `board_id`.
    pub fn is_last_user_connection(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        excluding: &ConnectionId,
    ) -> bool {
        !self.user_connections(user_id).iter().any(|id| {
            id != excluding
                && self
                    .connections
                    .get(id)
                    .is_some_and(|c| c.board_id.as_ref() == Some(board_id))
        })
    }

    pub fn active_boards(&self) -> Vec<BoardId> {
        self.boards.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    /// Every indexed id names a live record whose field matches its key, and
    /// every record is indexed under its own board and user.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for entry in self.boards.iter() {
            assert!(!entry.value().is_empty(), "empty board bucket {}", entry.key());
            for id in entry.value() {
                let conn = self.connections.get(id).expect("dangling board entry");
                assert_eq!(conn.board_id.as_ref(), Some(entry.key()));
            }
        }
        for entry in self.users.iter() {
            assert!(!entry.value().is_empty(), "empty user bucket {}", entry.key());
            for id in entry.value() {
                let conn = self.connections.get(id).expect("dangling user entry");
                assert_eq!(conn.user_id.as_ref(), Some(entry.key()));
            }
        }
        for entry in self.connections.iter() {
            if let Some(board) = &entry.board_id {
                assert!(self.boards.get(board).is_some_and(|s| s.contains(entry.key())));
            }
            if let Some(user) = &entry.user_id {
                assert!(self.users.get(user).is_some_and(|s| s.contains(entry.key())));
            }
        }
    }
}

fn index<K: Eq + Hash + Clone>(map: &DashMap<K, HashSet<ConnectionId>>, key: &K, id: &ConnectionId) {
    map.entry(key.clone()).or_default().insert(id.clone());
}

fn unindex<K: Eq + Hash>(map: &DashMap<K, HashSet<ConnectionId>>, key: &K, id: &ConnectionId) {
    if let Some(mut set) = map.get_mut(key) {
        set.remove(id);
    }
    map.remove_if(key, |_, set| set.is_empty());
}
