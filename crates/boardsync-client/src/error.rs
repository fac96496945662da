use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}")]
    Status { status: u16 },

    #[error("response has no body")]
    MissingBody,

    /// The server refused the stream because the user is at their connection cap.
    #[error("connection limit reached")]
    AdmissionRejected { retry_after: Option<Duration> },
}

impl ClientError {
    /// Whether the reconnection controller should try again.
    /// A rejected admission needs the user to free a slot first.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AdmissionRejected { .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
            },
            None => Self::Transport(e.to_string()),
        }
    }
}

/// Why a client reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Deliberate,
    AttemptsExhausted,
    AdmissionRejected,
}
