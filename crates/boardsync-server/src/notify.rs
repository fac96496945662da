use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use boardsync_core::{BoardEvent, BoardId, Outbound, PresenceError, PresenceStore, UserId};

use crate::dispatch::Delivery;
use crate::registry::{Connection, ConnectionRegistry};

/// Presence-aware broadcasts: `user_joined`, `user_left`, `presence_update`.
///
/// Each carries a `presence_data` snapshot when the presence store answers,
/// and goes out without it when the store fails. Every broadcast here settles
/// the connections it found dead, so a departure noticed mid-write is
/// announced like any other.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<dyn PresenceStore>,
}

impl Notifier {
    pub fn new(registry: Arc<ConnectionRegistry>, presence: Arc<dyn PresenceStore>) -> Self {
        Self { registry, presence }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.presence
    }

    pub async fn presence_data(&self, board_id: &BoardId) -> Result<Value, PresenceError> {
        let presence = self.presence.board_presence(board_id).await?;
        Ok(json!({
            "presence": presence,
            "connected_users_count": self.registry.active_user_count(board_id),
        }))
    }

    /// Board broadcast that announces any departures it causes.
    pub async fn broadcast(&self, board_id: &BoardId, event: &BoardEvent, exclude_user: Option<&UserId>) -> usize {
        let delivery = self.registry.broadcast_to_board(board_id, event, exclude_user);
        self.connections_closed(delivery.removed).await;
        delivery.sent
    }

    pub async fn dispatch(&self, outbound: &Outbound) -> usize {
        let delivery = self.registry.dispatch(outbound);
        self.connections_closed(delivery.removed).await;
        delivery.sent
    }

    pub async fn user_joined(&self, board_id: &BoardId, user_id: &UserId) -> usize {
        if let Err(e) = self.presence.touch(user_id, board_id, None).await {
            warn!(board_id = %board_id, user_id = %user_id, error = %e, "presence touch failed");
        }
        let event = BoardEvent::user_joined(board_id.clone(), user_id);
        let delivery = self.broadcast_with_presence(event).await;
        self.connections_closed(delivery.removed).await;
        delivery.sent
    }

    pub async fn user_left(&self, board_id: &BoardId, user_id: &UserId) -> usize {
        let event = BoardEvent::user_left(board_id.clone(), user_id);
        let delivery = self.broadcast_with_presence(event).await;
        self.connections_closed(delivery.removed).await;
        delivery.sent
    }

    pub async fn presence_update(&self, board_id: &BoardId, user_id: &UserId, activity: Value) -> usize {
        if let Err(e) = self
            .presence
            .touch(user_id, board_id, Some(activity.clone()))
            .await
        {
            warn!(board_id = %board_id, user_id = %user_id, error = %e, "presence touch failed");
        }
        let event = BoardEvent::presence_update(board_id.clone(), user_id, activity);
        let delivery = self.broadcast_with_presence(event).await;
        self.connections_closed(delivery.removed).await;
        delivery.sent
    }

    /// Follow-up for a connection that is already out of the registry: if it
    /// was the user's last one on its board, drop their presence row and tell
    /// the board they left.
    pub async fn connection_closed(&self, conn: &Connection) {
        let removed = self.departure(conn).await;
        self.connections_closed(removed).await;
    }

    /// [`Self::connection_closed`] for a batch. Connections found dead while
    /// announcing are settled in the same loop.
    pub async fn connections_closed(&self, mut removed: Vec<Connection>) {
        while let Some(conn) = removed.pop() {
            removed.extend(self.departure(&conn).await);
        }
    }

    async fn departure(&self, conn: &Connection) -> Vec<Connection> {
        let (Some(board_id), Some(user_id)) = (&conn.board_id, &conn.user_id) else {
            return Vec::new();
        };
        if !self.registry.is_last_user_connection(board_id, user_id, &conn.id) {
            return Vec::new();
        }
        if let Err(e) = self.presence.remove(user_id, board_id).await {
            warn!(board_id = %board_id, user_id = %user_id, error = %e, "presence remove failed");
        }
        let event = BoardEvent::user_left(board_id.clone(), user_id);
        self.broadcast_with_presence(event).await.removed
    }

    async fn broadcast_with_presence(&self, event: BoardEvent) -> Delivery {
        let event = match self.presence_data(&event.board_id).await {
            Ok(data) => event.with("presence_data", data),
            Err(e) => {
                warn!(board_id = %event.board_id, kind = %event.kind, error = %e, "presence data unavailable");
                event
            }
        };
        self.registry.broadcast_to_board(&event.board_id, &event, None)
    }
}
