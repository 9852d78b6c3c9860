//! Incremental parser for `text/event-stream` bodies.

use thiserror::Error;
use tracing::warn;

use crate::types::NotificationEvent;

pub const NOTIFICATION_EVENT: &str = "notification";
const HEARTBEAT: &str = "heartbeat";
/// Longest line buffered before it is dropped.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// One dispatched event block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `None` for the unnamed (`message`) channel.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed event payload")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Notification(NotificationEvent),
    Heartbeat,
    /// A named event this client has no use for.
    Ignored(String),
}

pub fn decode_frame(frame: &SseFrame) -> Result<Decoded, FrameError> {
    match frame.event.as_deref() {
        None => {
            let data = frame.data.trim();
            if data == HEARTBEAT || data.trim_matches('"') == HEARTBEAT {
                return Ok(Decoded::Heartbeat);
            }
            Ok(Decoded::Notification(serde_json::from_str(data)?))
        }
        Some(NOTIFICATION_EVENT) => Ok(Decoded::Notification(serde_json::from_str(&frame.data)?)),
        Some(other) => Ok(Decoded::Ignored(other.to_string())),
    }
}

#[derive(Debug)]
pub struct FrameParser {
    pending: Vec<u8>,
    max_line: usize,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
    skip_lf: bool,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: false,
            skip_lf: false,
            event: None,
            data: Vec::new(),
            id: None,
            last_event_id: None,
            retry_ms: None,
        }
    }

    /// Feeds a chunk; chunk boundaries may fall anywhere, including inside a
    /// multi-byte character or between `\r` and `\n`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut frames),
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut frames);
                }
                _ if self.discarding => {}
                _ if self.pending.len() >= self.max_line => {
                    warn!(limit = self.max_line, "stream line too long; dropping it");
                    self.pending = Vec::new();
                    self.discarding = true;
                }
                _ => self.pending.push(byte),
            }
        }
        frames
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect delay announced by the server, if any since the last call.
    pub fn take_retry(&mut self) -> Option<u64> {
        self.retry_ms.take()
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        if self.discarding {
            self.discarding = false;
            return;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw);

        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (&line[..], ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    self.retry_ms = value.parse().ok();
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        let event = self.event.take().filter(|e| !e.is_empty());
        let id = self.id.take();
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        frames.push(SseFrame { event, data, id });
    }
}
