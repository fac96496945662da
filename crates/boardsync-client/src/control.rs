use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use boardsync_core::{BoardId, UserId};

use crate::error::ClientError;

/// Side channel for board membership and presence, posted next to an open stream.
#[derive(Clone)]
pub struct ControlClient {
    http: Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl ControlClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub async fn join_board(
        &self,
        client_id: &str,
        board_id: &BoardId,
        user_id: Option<&UserId>,
    ) -> Result<(), ClientError> {
        self.send(json!({
            "action": "join_board",
            "clientId": client_id,
            "boardId": board_id,
            "userId": user_id,
        }))
        .await
    }

    pub async fn leave_board(&self, client_id: &str) -> Result<(), ClientError> {
        self.send(json!({ "action": "leave_board", "clientId": client_id })).await
    }

    pub async fn presence_update(&self, client_id: &str, activity: Value) -> Result<(), ClientError> {
        self.send(json!({
            "action": "presence_update",
            "clientId": client_id,
            "data": activity,
        }))
        .await
    }

    #[instrument(skip(self, body), fields(action = %body["action"]))]
    async fn send(&self, body: Value) -> Result<(), ClientError> {
        let mut req = self.http.post(&self.url).json(&body);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .map(std::time::Duration::from_secs);
            return Err(ClientError::AdmissionRejected { retry_after });
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
            });
        }
        debug!("control action acknowledged");
        Ok(())
    }
}
