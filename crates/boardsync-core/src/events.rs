use bytes::Bytes;
use serde_json::{Map, Value};

use crate::frame::Frame;
use crate::ids::{BoardId, UserId};

pub const CARD_CREATED: &str = "card_created";
pub const CARD_UPDATED: &str = "card_updated";
pub const CARD_DELETED: &str = "card_deleted";
pub const VOTE_CHANGED: &str = "vote_changed";
pub const COMMENT_ADDED: &str = "comment_added";
pub const BOARD_UPDATED: &str = "board_updated";
pub const COLUMNS_UPDATED: &str = "columns_updated";
pub const SCENE_CREATED: &str = "scene_created";
pub const SCENE_CHANGED: &str = "scene_changed";
pub const USER_JOINED: &str = "user_joined";
pub const USER_LEFT: &str = "user_left";
pub const PRESENCE_UPDATE: &str = "presence_update";
pub const PRESENCE_PING: &str = "presence_ping";
pub const KICKED: &str = "kicked";

/// A board-scoped state change, serialized as one JSON object:
/// `{"type": .., "board_id": .., <payload fields>, "timestamp": <ms>}`.
///
/// Payloads are self-describing snapshots or deltas, so clients can apply
/// events from independent broadcasts in any order.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardEvent {
    pub kind: String,
    pub board_id: BoardId,
    pub payload: Map<String, Value>,
    pub timestamp: i64,
}

impl BoardEvent {
    pub fn new(kind: impl Into<String>, board_id: BoardId) -> Self {
        Self {
            kind: kind.into(),
            board_id,
            payload: Map::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Add a payload field. `type`, `board_id` and `timestamp` are reserved.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !matches!(key, "type" | "board_id" | "timestamp") {
            self.payload.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn card_created(board_id: BoardId, card: Value) -> Self {
        Self::new(CARD_CREATED, board_id).with("card", card)
    }

    pub fn card_updated(board_id: BoardId, card: Value) -> Self {
        Self::new(CARD_UPDATED, board_id).with("card", card)
    }

    pub fn card_deleted(board_id: BoardId, card_id: &str) -> Self {
        Self::new(CARD_DELETED, board_id).with("card_id", card_id)
    }

    pub fn vote_changed(board_id: BoardId, card_id: &str, vote_count: i64) -> Self {
        Self::new(VOTE_CHANGED, board_id)
            .with("card_id", card_id)
            .with("vote_count", vote_count)
    }

    pub fn comment_added(board_id: BoardId, comment: Value) -> Self {
        Self::new(COMMENT_ADDED, board_id).with("comment", comment)
    }

    pub fn board_updated(board_id: BoardId, board: Value) -> Self {
        Self::new(BOARD_UPDATED, board_id).with("board", board)
    }

    pub fn columns_updated(board_id: BoardId, columns: Value) -> Self {
        Self::new(COLUMNS_UPDATED, board_id).with("columns", columns)
    }

    pub fn scene_created(board_id: BoardId, scene: Value) -> Self {
        Self::new(SCENE_CREATED, board_id).with("scene", scene)
    }

    pub fn scene_changed(board_id: BoardId, scene: Value) -> Self {
        Self::new(SCENE_CHANGED, board_id).with("scene", scene)
    }

    pub fn user_joined(board_id: BoardId, user_id: &UserId) -> Self {
        Self::new(USER_JOINED, board_id).with("user_id", user_id.as_str())
    }

    pub fn user_left(board_id: BoardId, user_id: &UserId) -> Self {
        Self::new(USER_LEFT, board_id).with("user_id", user_id.as_str())
    }

    pub fn presence_update(board_id: BoardId, user_id: &UserId, activity: Value) -> Self {
        Self::new(PRESENCE_UPDATE, board_id)
            .with("user_id", user_id.as_str())
            .with("activity", activity)
    }

    pub fn presence_ping(board_id: BoardId) -> Self {
        Self::new(PRESENCE_PING, board_id)
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::with_capacity(self.payload.len() + 3);
        obj.insert("type".into(), Value::String(self.kind.clone()));
        obj.insert("board_id".into(), Value::String(self.board_id.to_string()));
        for (k, v) in &self.payload {
            obj.insert(k.clone(), v.clone());
        }
        obj.insert("timestamp".into(), Value::from(self.timestamp));
        Value::Object(obj)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.to_json().to_string()).event(self.kind.clone())
    }

    /// Encode once; the returned bytes are shared by every sink in a fan-out.
    pub fn encode(&self) -> Bytes {
        self.to_frame().to_bytes()
    }
}

/// Termination notice pushed to a connection right before an admin removes it.
/// Not board-scoped: the target may never have joined a board.
pub fn kicked(redirect_to: &str) -> Bytes {
    let body = serde_json::json!({
        "type": KICKED,
        "redirectTo": redirect_to,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    });
    Frame::new(body.to_string()).event(KICKED).to_bytes()
}

/// Routing envelope handed to the dispatcher.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// Every connection on the board.
    Board(BoardEvent),
    /// Every connection on the board except the sender's own.
    BoardExcept { event: BoardEvent, exclude_user: UserId },
    /// Only the target user's connections on the board.
    User { event: BoardEvent, user_id: UserId },
}

impl Outbound {
    pub fn event(&self) -> &BoardEvent {
        match self {
            Self::Board(event)
            | Self::BoardExcept { event, .. }
            | Self::User { event, .. } => event,
        }
    }

    pub fn board_id(&self) -> &BoardId {
        &self.event().board_id
    }
}
