//! Downstream SSE multiplexer (C8) — spec §4.8/§9.
//!
//! Grounded on `llm/helpers.rs`'s callback-driven writes
//! (`on_content`/`on_tool_calls`/...), replaced with a single bounded
//! channel: spec §4.8 requires exactly one writer per turn so frame
//! ordering is never interleaved by two concurrent producers. The
//! orchestrator is that one writer; [`crate::server`] only ever reads.

use crate::types::{StreamEvent, ToolCall, ToolOutputStatus};
use serde_json::json;
use tokio::sync::mpsc;

/// One frame ready to render onto the wire. `Json` carries the chunk body;
/// `Done` is the literal `data: [DONE]` sentinel (spec §4.8).
#[derive(Debug, Clone)]
pub enum WireFrame {
    Json(serde_json::Value),
    Done,
}

impl WireFrame {
    /// The exact bytes of the SSE `data:` payload (without surrounding
    /// `event:`/blank-line framing, which [`crate::server`] adds).
    pub fn data(&self) -> String {
        match self {
            WireFrame::Json(value) => value.to_string(),
            WireFrame::Done => "[DONE]".to_string(),
        }
    }
}

/// The single-writer handle the orchestrator holds for one turn.
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<WireFrame>,
}

/// The read side [`crate::server`]'s SSE handler drains.
pub struct StreamReader {
    rx: mpsc::Receiver<WireFrame>,
}

/// Create a bounded channel (capacity 64 per spec §5's `downstreamFrames`).
pub fn channel(capacity: usize) -> (StreamWriter, StreamReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (StreamWriter { tx }, StreamReader { rx })
}

impl StreamWriter {
    /// Render and send one engine-internal event. Returns `false` once the
    /// reader has been dropped (client closed the connection) — per spec
    /// §4.8 the orchestrator should stop producing further work once this
    /// happens rather than buffering indefinitely.
    pub async fn send_event(&self, event: &StreamEvent) -> bool {
        self.tx.send(WireFrame::Json(render(event))).await.is_ok()
    }

    /// Send the terminal `[DONE]` sentinel. Always the last frame written.
    pub async fn send_done(&self) {
        let _ = self.tx.send(WireFrame::Done).await;
    }
}

impl StreamReader {
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.rx.recv().await
    }
}

/// Render one internal event into its wire JSON shape. `pub(crate)` so
/// [`crate::orchestrator`] can reuse it to build the non-streaming
/// response's `tool_events[]` log (spec §6) from the same events it sends
/// down the wire, instead of keeping two renderings in sync.
pub(crate) fn render(event: &StreamEvent) -> serde_json::Value {
    match event {
        StreamEvent::ContentDelta(text) => json!({
            "choices": [{ "delta": { "content": text } }]
        }),
        StreamEvent::ReasoningDelta(text) => json!({
            "choices": [{ "delta": { "reasoning_content": text } }]
        }),
        StreamEvent::ToolCalls(calls) => json!({
            "choices": [{ "delta": { "tool_calls": render_tool_calls(calls) } }]
        }),
        StreamEvent::ToolOutput {
            tool_call_id,
            name,
            output,
            status,
        } => json!({
            "choices": [{ "delta": { "tool_output": {
                "tool_call_id": tool_call_id,
                "name": name,
                "output": output,
                "status": match status {
                    ToolOutputStatus::Success => "success",
                    ToolOutputStatus::Error => "error",
                },
            } } }]
        }),
        StreamEvent::ConversationMetadata(frame) => json!({ "_conversation": frame }),
        StreamEvent::FinalChunk { finish_reason } => json!({
            "choices": [{ "delta": {}, "finish_reason": finish_reason.as_str() }]
        }),
        StreamEvent::Error(message) => json!({ "error": message }),
    }
}

fn render_tool_calls(calls: &[ToolCall]) -> Vec<serde_json::Value> {
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "index": index,
                "id": call.id,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments },
            })
        })
        .collect()
}
