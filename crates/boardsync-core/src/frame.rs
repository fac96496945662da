//! Server-side encoder for the streaming wire format.
//!
//! A frame is an optional `event:` line, one `data:` line per payload line,
//! optional `id:` and `retry:` lines, and a terminating blank line. Lines
//! starting with `:` are comments and carry no payload.

use bytes::Bytes;

/// Comment frame written by the keep-alive loop.
pub const HEARTBEAT: &str = ": heartbeat\n\n";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl Frame {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Render the frame. Multi-line data becomes one `data:` line per line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(single_line(event));
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(single_line(id));
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        out.push('\n');
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }
}

/// Comment frame with arbitrary text, e.g. `: heartbeat`.
pub fn comment(text: &str) -> Bytes {
    Bytes::from(format!(": {}\n\n", single_line(text)))
}

pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT.as_bytes())
}

// Field values other than data cannot span lines.
fn single_line(s: &str) -> &str {
    s.split(['\r', '\n']).next().unwrap_or("")
}
