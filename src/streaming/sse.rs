// src/streaming/sse.rs

use serde_json::Value;
use thiserror::Error;

/// One complete event recovered from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// The `[DONE]` sentinel.
    Done,
    /// A parsed JSON event, with the exact payload text preserved for
    /// re-framing.
    Json { payload: String, value: Value },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SseError {
    #[error("buffered stream data exceeded {limit} bytes without a complete event")]
    Oversize { limit: usize },
}

/// Reassembles Server-Sent Events from arbitrary byte chunks.
///
/// Providers fragment freely: one chunk may hold several events, half an
/// event, or even a frame boundary that falls inside a fragmented JSON
/// payload. A candidate frame is only consumed once its payload parses as
/// JSON (or is the `[DONE]` sentinel); otherwise the bytes are held until
/// the remainder arrives. Held data is bounded by `max_event_bytes`.
#[derive(Debug)]
pub struct SseBuffer {
    buf: Vec<u8>,
    /// Offset of the first frame boundary not yet ruled out. Boundaries
    /// before this point sat inside an incomplete payload.
    search_from: usize,
    max_event_bytes: usize,
}

impl SseBuffer {
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            search_from: 0,
            max_event_bytes,
        }
    }

    /// Appends a chunk and drains every complete event it unlocked.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, SseError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((sep_at, sep_len)) = find_frame_boundary(&self.buf, self.search_from) {
            let frame = &self.buf[..sep_at];
            match parse_frame(frame) {
                FrameOutcome::Event(event) => {
                    self.buf.drain(..sep_at + sep_len);
                    self.search_from = 0;
                    events.push(event);
                }
                FrameOutcome::Ignore => {
                    self.buf.drain(..sep_at + sep_len);
                    self.search_from = 0;
                }
                FrameOutcome::Incomplete => {
                    // The separator fell inside a fragmented payload; look
                    // past it next time.
                    self.search_from = sep_at + sep_len;
                }
            }
        }

        if self.buf.len() > self.max_event_bytes {
            return Err(SseError::Oversize {
                limit: self.max_event_bytes,
            });
        }
        Ok(events)
    }

    /// Bytes currently held waiting for more data.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

enum FrameOutcome {
    Event(SseEvent),
    /// Comment or empty frame.
    Ignore,
    /// Payload present but not yet parseable.
    Incomplete,
}

/// Earliest `\n\n` or `\r\n\r\n` at or after `from`.
fn find_frame_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_frame(frame: &[u8]) -> FrameOutcome {
    let Ok(text) = std::str::from_utf8(frame) else {
        // Likely a UTF-8 sequence split across chunks.
        return FrameOutcome::Incomplete;
    };

    let mut payload = String::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            if !payload.is_empty() {
                payload.push('\n');
            }
            payload.push_str(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if payload.is_empty() {
        return FrameOutcome::Ignore;
    }
    if payload.trim() == "[DONE]" {
        return FrameOutcome::Event(SseEvent::Done);
    }
    match serde_json::from_str::<Value>(&payload) {
        Ok(value) => FrameOutcome::Event(SseEvent::Json { payload, value }),
        Err(_) => FrameOutcome::Incomplete,
    }
}
