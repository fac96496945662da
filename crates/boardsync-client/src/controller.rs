//! Reconnection state machine. Pure: it decides, the client task acts.

use std::time::Duration;

use crate::error::CloseReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening, or waiting to open. `attempt` is 0 for the first open.
    Connecting { attempt: u32 },
    Open,
    /// Terminal.
    Closed(CloseReason),
}

/// What the client does after a failed open or an ended stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    Retry { attempt: u32, delay: Duration },
    /// This failure used up the last attempt; the controller is now closed.
    Exhausted,
    /// Already closed. Nothing to do.
    Stopped,
}

#[derive(Debug)]
pub struct ReconnectController {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    default_delay: Duration,
    server_delay: Option<Duration>,
}

impl ReconnectController {
    pub fn new(default_delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Connecting { attempt: 0 },
            attempts: 0,
            max_attempts,
            default_delay,
            server_delay: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed(_))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fixed delay: the last server `retry:` value, else the configured default.
    pub fn delay(&self) -> Duration {
        self.server_delay.unwrap_or(self.default_delay)
    }

    pub fn set_retry(&mut self, ms: u64) {
        self.server_delay = Some(Duration::from_millis(ms));
    }

    /// Returns false if the controller was closed while the open was in flight.
    pub fn on_open(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = ConnectionState::Open;
        self.attempts = 0;
        true
    }

    pub fn on_failure(&mut self) -> Next {
        if self.is_closed() {
            return Next::Stopped;
        }
        if self.attempts >= self.max_attempts {
            self.state = ConnectionState::Closed(CloseReason::AttemptsExhausted);
            return Next::Exhausted;
        }
        self.attempts += 1;
        self.state = ConnectionState::Connecting {
            attempt: self.attempts,
        };
        Next::Retry {
            attempt: self.attempts,
            delay: self.delay(),
        }
    }

    /// Move to `Closed(reason)`. Returns true only on the transition, so the
    /// close callback fires once.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = ConnectionState::Closed(reason);
        true
    }
}
