//! SSE codec (C1) — spec §4.1.
//!
//! Grounded on the teacher's `eventsource_stream::Eventsource` usage in
//! `llm/openai.rs`/`llm/anthropic.rs`, but made an explicit, engine-owned
//! decoder: Anthropic's multi-event-type framing (`message_start`,
//! `content_block_delta`, ...) needs the raw `event:` line alongside
//! `data:`, which the teacher left to the `eventsource-stream` crate. This
//! decoder carries partial lines across chunk boundaries itself so both
//! adapters can share one restartable, non-reentrant byte-stream decoder.

use bytes::{Buf, Bytes, BytesMut};

/// One decoded SSE frame: the (possibly empty) `event:` name and the
/// `data:` payload lines joined with `\n`, per the SSE spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: Option<String>,
    pub data: String,
}

/// The events the codec yields to its caller.
#[derive(Debug, Clone)]
pub enum SseEvent {
    /// A `data:` payload that parsed as JSON.
    Json {
        event: Option<String>,
        value: serde_json::Value,
    },
    /// A `data:` payload that failed to parse as JSON — surfaced, not fatal
    /// (spec §4.1: "JSON failures yield a ParseError event ... but do not
    /// abort the codec").
    ParseError { event: Option<String>, raw: String },
    /// The literal `data: [DONE]` sentinel. The codec stops emitting from
    /// that frame onward once this is seen (spec §4.1's intentional
    /// departure from strict SSE).
    Done,
}

/// A restartable, non-reentrant decoder over a byte stream.
///
/// Construct one per upstream stream; feed it chunks via [`Self::push`] and
/// drain events with [`Self::next_event`]/[`Self::drain`]. A chunk boundary
/// that splits a frame is carried in `tail` until the next push completes it.
#[derive(Debug, Default)]
pub struct SseDecoder {
    tail: BytesMut,
    frames: std::collections::VecDeque<RawFrame>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of bytes from the wire. Frames completed by this
    /// chunk (terminated by `\n\n` or `\r\n\r\n`) are queued for
    /// [`Self::next_event`]; any trailing partial frame is retained.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        self.tail.extend_from_slice(chunk);

        loop {
            let Some(boundary) = find_event_boundary(&self.tail) else {
                break;
            };
            let frame_bytes = self.tail.split_to(boundary.frame_end);
            self.tail.advance(boundary.sep_len);
            if let Some(frame) = parse_frame(&frame_bytes) {
                self.frames.push_back(frame);
            }
        }
    }

    /// Decode and return the next available event, if any frame is queued.
    /// Returns `None` only when no complete frame has been decoded yet —
    /// call [`Self::push`] again and retry.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        if self.done {
            return None;
        }
        let frame = self.frames.pop_front()?;
        if frame.data == "[DONE]" {
            self.done = true;
            self.frames.clear();
            return Some(SseEvent::Done);
        }
        match serde_json::from_str::<serde_json::Value>(&frame.data) {
            Ok(value) => Some(SseEvent::Json {
                event: frame.event,
                value,
            }),
            Err(_) => Some(SseEvent::ParseError {
                event: frame.event,
                raw: frame.data,
            }),
        }
    }

    /// Drain every currently-queued event (used by tests feeding a whole
    /// stream at once; see [`crate::sse`]'s round-trip property R2).
    pub fn drain(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.next_event() {
            out.push(ev);
        }
        out
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

struct Boundary {
    frame_end: usize,
    sep_len: usize,
}

/// Find the first `\n\n` or `\r\n\r\n` in `buf`, returning the frame's byte
/// length (excluding the separator) and the separator's length.
fn find_event_boundary(buf: &BytesMut) -> Option<Boundary> {
    let bytes = buf.as_ref();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            return Some(Boundary {
                frame_end: i,
                sep_len: 2,
            });
        }
        if i + 3 < bytes.len()
            && bytes[i] == b'\r'
            && bytes[i + 1] == b'\n'
            && bytes[i + 2] == b'\r'
            && bytes[i + 3] == b'\n'
        {
            return Some(Boundary {
                frame_end: i,
                sep_len: 4,
            });
        }
        i += 1;
    }
    None
}

/// Parse a frame's lines, keeping only `event:` and `data:` lines per
/// spec §4.1 (`^data:\s*(.*)$`); multiple `data:` lines join with `\n`.
fn parse_frame(bytes: &Bytes) -> Option<RawFrame> {
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.split(['\n']) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(RawFrame {
        event,
        data: data_lines.join("\n"),
    })
}
