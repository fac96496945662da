use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{BoardId, UserId};

/// Durable per-user, per-board activity record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub board_id: BoardId,
    /// Unix milliseconds.
    pub last_seen: i64,
    pub current_activity: Option<serde_json::Value>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence backend unavailable: {0}")]
    Unavailable(String),
    #[error("presence backend failed: {0}")]
    Backend(String),
}

/// Presence repository consumed by the dispatcher and the ping loop.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record activity now. Upserts the `(user, board)` row.
    async fn touch(
        &self,
        user_id: &UserId,
        board_id: &BoardId,
        activity: Option<serde_json::Value>,
    ) -> Result<(), PresenceError>;

    async fn board_presence(&self, board_id: &BoardId) -> Result<Vec<PresenceEntry>, PresenceError>;

    /// Users on the board whose last activity is old enough that they are
    /// about to be considered gone.
    async fn users_nearing_timeout(&self, board_id: &BoardId) -> Result<Vec<UserId>, PresenceError>;

    async fn remove(&self, user_id: &UserId, board_id: &BoardId) -> Result<(), PresenceError>;
}
