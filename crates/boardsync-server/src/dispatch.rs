//! Fan-out on top of [`ConnectionRegistry`].
//!
//! Every delivery snapshots the target ids first, writes to each sink without
//! blocking, and removes connections whose sink failed only after the pass.
//! A failed sink never aborts delivery to the rest. The removed records come
//! back in [`Delivery::removed`] so the caller can announce departures.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use boardsync_core::{events, frame, BoardEvent, BoardId, ConnectionId, Outbound, UserId};

use crate::error::SinkError;
use crate::registry::{Connection, ConnectionRegistry};

/// Outcome of one fan-out pass.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Writes that landed in a send queue.
    pub sent: usize,
    /// Connections dropped because their sink was closed or full.
    pub removed: Vec<Connection>,
}

impl ConnectionRegistry {
    /// Write `frame` to each listed connection that passes `filter`.
    fn deliver<F>(&self, ids: &[ConnectionId], frame: &Bytes, filter: F) -> Delivery
    where
        F: Fn(&Connection) -> bool,
    {
        let mut sent = 0;
        let mut dead = Vec::new();

        for id in ids {
            let result = {
                let Some(mut conn) = self.connections.get_mut(id) else {
                    continue;
                };
                if !filter(conn.value()) {
                    continue;
                }
                let result = conn.sink.write(frame);
                if result.is_ok() {
                    conn.last_seen = Instant::now();
                }
                result
            };
            match result {
                Ok(()) => sent += 1,
                // A reader this far behind has lost frames it cannot recover.
                Err(SinkError::Full) => {
                    warn!(connection_id = %id, frame_len = frame.len(), "send queue full, dropping connection");
                    dead.push(id.clone());
                }
                Err(SinkError::Closed) => dead.push(id.clone()),
            }
        }

        let removed = dead
            .iter()
            .filter_map(|id| {
                debug!(connection_id = %id, "removing dead connection");
                self.remove(id)
            })
            .collect();
        Delivery { sent, removed }
    }

    /// Send to every connection on the board, skipping `exclude_user`'s own.
    pub fn broadcast_to_board(
        &self,
        board_id: &BoardId,
        event: &BoardEvent,
        exclude_user: Option<&UserId>,
    ) -> Delivery {
        let ids = self.board_connections(board_id);
        if ids.is_empty() {
            return Delivery::default();
        }
        let frame = event.encode();
        let delivery = self.deliver(&ids, &frame, |conn| {
            conn.board_id.as_ref() == Some(board_id)
                && (exclude_user.is_none() || conn.user_id.as_ref() != exclude_user)
        });
        debug!(
            board_id = %board_id,
            kind = %event.kind,
            targets = ids.len(),
            sent = delivery.sent,
            "board broadcast"
        );
        delivery
    }

    /// Send to one user's connections on the board (every open tab).
    pub fn broadcast_to_user(&self, board_id: &BoardId, user_id: &UserId, event: &BoardEvent) -> Delivery {
        let ids = self.board_connections(board_id);
        let frame = event.encode();
        let delivery = self.deliver(&ids, &frame, |conn| {
            conn.board_id.as_ref() == Some(board_id) && conn.user_id.as_ref() == Some(user_id)
        });
        debug!(board_id = %board_id, user_id = %user_id, kind = %event.kind, sent = delivery.sent, "user broadcast");
        delivery
    }

    pub fn send_to_one(&self, id: &ConnectionId, event: &BoardEvent) -> Delivery {
        self.send_frame(id, &event.encode())
    }

    /// Write an already-encoded frame to one connection.
    pub fn send_frame(&self, id: &ConnectionId, frame: &Bytes) -> Delivery {
        self.deliver(std::slice::from_ref(id), frame, |_| true)
    }

    pub fn dispatch(&self, outbound: &Outbound) -> Delivery {
        match outbound {
            Outbound::Board(event) => self.broadcast_to_board(&event.board_id, event, None),
            Outbound::BoardExcept { event, exclude_user } => {
                self.broadcast_to_board(&event.board_id, event, Some(exclude_user))
            }
            Outbound::User { event, user_id } => {
                self.broadcast_to_user(&event.board_id, user_id, event)
            }
        }
    }

    /// Keep-alive comment to every connection.
    pub fn heartbeat(&self) -> Delivery {
        let ids = self.all_connections();
        self.deliver(&ids, &frame::heartbeat(), |_| true)
    }

    /// Send `presence_ping` to every tab on the board of each user in
    /// `nearing`, at most once per `spacing` per user and board.
    pub fn ping_users(&self, board_id: &BoardId, nearing: &HashSet<UserId>, spacing: Duration) -> Delivery {
        if nearing.is_empty() {
            return Delivery::default();
        }
        let now = Instant::now();
        let due = |user: &UserId| {
            self.last_pings
                .get(&(board_id.clone(), user.clone()))
                .map_or(true, |at| now.saturating_duration_since(*at) >= spacing)
        };

        let mut targets = Vec::new();
        let mut pinged = HashSet::new();
        for (user, id) in self.connected_users(board_id) {
            if nearing.contains(&user) && (pinged.contains(&user) || due(&user)) {
                pinged.insert(user);
                targets.push(id);
            }
        }
        if targets.is_empty() {
            return Delivery::default();
        }

        let frame = BoardEvent::presence_ping(board_id.clone()).encode();
        let delivery = self.deliver(&targets, &frame, |conn| conn.board_id.as_ref() == Some(board_id));
        for user in pinged {
            self.last_pings.insert((board_id.clone(), user), now);
        }
        if delivery.sent > 0 {
            debug!(board_id = %board_id, sent = delivery.sent, "presence pings sent");
        }
        delivery
    }

    /// Drop ping stamps for users no longer connected to that board.
    pub(crate) fn forget_stale_pings(&self) {
        let keys: Vec<(BoardId, UserId)> = self.last_pings.iter().map(|e| e.key().clone()).collect();
        for (board_id, user_id) in keys {
            let present = self
                .connected_users(&board_id)
                .iter()
                .any(|(user, _)| *user == user_id);
            if !present {
                self.last_pings.remove(&(board_id, user_id));
            }
        }
    }

    /// Push a `kicked` notice to every connection of the user, then remove them.
    /// Returns the removed records.
    pub fn kick_user(&self, user_id: &UserId, redirect_to: &str) -> Vec<Connection> {
        let ids = self.user_connections(user_id);
        let removed = self.kick(&ids, redirect_to);
        warn!(user_id = %user_id, kicked = removed.len(), "user kicked");
        removed
    }

    pub fn kick_client(&self, id: &ConnectionId, redirect_to: &str) -> Option<Connection> {
        let removed = self.kick(std::slice::from_ref(id), redirect_to).pop();
        if removed.is_some() {
            warn!(connection_id = %id, "client kicked");
        }
        removed
    }

    fn kick(&self, ids: &[ConnectionId], redirect_to: &str) -> Vec<Connection> {
        let notice = events::kicked(redirect_to);
        // Best effort: the connection goes away whether or not the notice lands.
        let mut removed = self.deliver(ids, &notice, |_| true).removed;
        removed.extend(ids.iter().filter_map(|id| self.remove(id)));
        removed
    }
}
