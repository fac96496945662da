//! Incremental decoder for the streaming wire format.
//!
//! Bytes arrive in arbitrary chunks. The decoder holds back an incomplete
//! UTF-8 sequence and an incomplete trailing line between calls, so a frame
//! split anywhere (even inside a multi-byte character) decodes exactly as if
//! it had arrived whole.

use tracing::warn;

/// Type used when a frame has no `event:` line.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    pub event_type: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Output of [`StreamDecoder::feed`], in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame with a non-empty data field.
    Event(StreamEvent),
    /// A parseable `retry:` line. Emitted as soon as the line is read.
    Retry(u64),
}

#[derive(Default)]
pub struct StreamDecoder {
    line_buf: String,
    line_corrupt: bool,
    utf8_tail: Vec<u8>,
    frame: PartialFrame,
}

#[derive(Default)]
struct PartialFrame {
    event_type: Option<String>,
    data: String,
    id: Option<String>,
    retry: Option<u64>,
    corrupt: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk and return everything it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.push_text(text, &mut out);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.push_text(text, &mut out);
                    }
                    match e.error_len() {
                        // Truncated sequence at the end of the chunk: wait for more bytes.
                        None => {
                            self.utf8_tail = tail.to_vec();
                            break;
                        }
                        Some(len) => {
                            self.line_corrupt = true;
                            rest = &tail[len..];
                        }
                    }
                }
            }
        }
        out
    }

    /// Text held back because it does not end in a line break yet.
    pub fn pending(&self) -> &str {
        &self.line_buf
    }

    fn push_text(&mut self, text: &str, out: &mut Vec<Decoded>) {
        self.line_buf.push_str(text);
        while let Some(pos) = self.line_buf.find('\n') {
            let mut line: String = self.line_buf.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            let corrupt = std::mem::take(&mut self.line_corrupt);
            self.process_line(&line, corrupt, out);
        }
    }

    fn process_line(&mut self, line: &str, corrupt: bool, out: &mut Vec<Decoded>) {
        if corrupt {
            warn!(line_len = line.len(), "invalid UTF-8 in stream frame");
            self.frame.corrupt = true;
        }

        if line.is_empty() {
            self.finish_frame(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let Some((field, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();
        match field.trim() {
            "event" => self.frame.event_type = Some(value.to_string()),
            "data" => {
                self.frame.data.push_str(value);
                self.frame.data.push('\n');
            }
            "id" => self.frame.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.frame.retry = Some(ms);
                    out.push(Decoded::Retry(ms));
                }
            }
            _ => {}
        }
    }

    fn finish_frame(&mut self, out: &mut Vec<Decoded>) {
        let frame = std::mem::take(&mut self.frame);
        if frame.corrupt {
            warn!("dropping malformed stream frame");
            return;
        }
        if frame.data.is_empty() {
            return;
        }
        let mut data = frame.data;
        data.pop();
        let event_type = frame
            .event_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
        out.push(Decoded::Event(StreamEvent {
            event_type,
            data,
            id: frame.id,
            retry: frame.retry,
        }));
    }
}
