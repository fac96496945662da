//! Wire types for the control channel and admin surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use boardsync_core::{BoardId, ConnectionId, UserId};

use crate::registry::ConnectionInfo;

pub const CONNECT_INTENT: &str = "sse_connect";
pub const DEFAULT_KICK_REDIRECT: &str = "/dashboard";

/// Body of a POST that opens a stream instead of sending a control action.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub board_id: Option<BoardId>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "boardId")]
    pub board_id: Option<BoardId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub action: String,
    pub client_id: ConnectionId,
    pub board_id: Option<BoardId>,
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    JoinBoard,
    LeaveBoard,
    PresenceUpdate,
}

impl std::str::FromStr for ControlAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "join_board" => Ok(Self::JoinBoard),
            "leave_board" => Ok(Self::LeaveBoard),
            "presence_update" => Ok(Self::PresenceUpdate),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Payload of the first frame on every stream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub client_id: ConnectionId,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
pub enum AdminAction {
    #[serde(rename = "kickUser", rename_all = "camelCase")]
    KickUser {
        user_id: UserId,
        redirect_to: Option<String>,
    },
    #[serde(rename = "kickClient", rename_all = "camelCase")]
    KickClient {
        client_id: ConnectionId,
        redirect_to: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KickResult {
    pub success: bool,
    pub kicked: usize,
}

/// Admin view: every connection plus per-user and per-board tallies.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSnapshot {
    pub total_connections: usize,
    pub total_users: usize,
    pub total_boards: usize,
    pub by_user: BTreeMap<UserId, usize>,
    pub by_board: BTreeMap<BoardId, usize>,
    pub connections: Vec<ConnectionInfo>,
}

impl AdminSnapshot {
    pub fn from_connections(connections: Vec<ConnectionInfo>) -> Self {
        let mut by_user = BTreeMap::new();
        let mut by_board = BTreeMap::new();
        for conn in &connections {
            if let Some(user) = &conn.user_id {
                *by_user.entry(user.clone()).or_insert(0) += 1;
            }
            if let Some(board) = &conn.board_id {
                *by_board.entry(board.clone()).or_insert(0) += 1;
            }
        }
        Self {
            total_connections: connections.len(),
            total_users: by_user.len(),
            total_boards: by_board.len(),
            by_user,
            by_board,
            connections,
        }
    }
}
