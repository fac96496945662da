use std::collections::HashMap;
use std::sync::Arc;

use boardsync_core::decoder::DEFAULT_EVENT_TYPE;
use boardsync_core::StreamEvent;

use crate::error::{ClientError, CloseReason};

pub type EventListener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(CloseReason) + Send + Sync>;
/// Called with `(attempt, max_attempts)` each time a retry is scheduled.
pub type ReconnectHandler = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Event listeners keyed by event type, plus the catch-all message listeners.
#[derive(Default, Clone)]
pub struct Listeners {
    by_type: HashMap<String, Vec<EventListener>>,
    on_message: Vec<EventListener>,
}

impl Listeners {
    pub fn add(&mut self, event_type: impl Into<String>, listener: EventListener) {
        self.by_type.entry(event_type.into()).or_default().push(listener);
    }

    pub fn add_message(&mut self, listener: EventListener) {
        self.on_message.push(listener);
    }

    /// Listeners for one event, in call order: those for its type, then the
    /// catch-all listeners, then those registered for `"message"` unless the
    /// type already is `"message"`.
    pub fn targets(&self, event_type: &str) -> Vec<EventListener> {
        let mut out: Vec<EventListener> = self.by_type.get(event_type).cloned().unwrap_or_default();
        out.extend(self.on_message.iter().cloned());
        if event_type != DEFAULT_EVENT_TYPE {
            if let Some(generic) = self.by_type.get(DEFAULT_EVENT_TYPE) {
                out.extend(generic.iter().cloned());
            }
        }
        out
    }
}

/// Lifecycle callbacks.
#[derive(Default, Clone)]
pub struct Handlers {
    pub open: Vec<OpenHandler>,
    pub error: Vec<ErrorHandler>,
    pub close: Vec<CloseHandler>,
    pub reconnect: Vec<ReconnectHandler>,
}
