//! Anthropic Messages adapter.
//!
//! Grounded on `llm/anthropic.rs`'s wire types and `build_request_body`/
//! `parse_finish_reason`, minus its own `chat_loop` background task.
//! Anthropic's streaming dialect spreads one tool call across three event
//! *types* (`content_block_start` carries id+name, `content_block_delta`
//! carries `input_json_delta` fragments, `content_block_stop` closes it) —
//! the teacher handles this inline in one big `match`; here it is
//! translated into the same index-keyed `AdapterEvent::ToolCallDelta`
//! stream the OpenAI adapter produces, so [`crate::assembler`] never has to
//! know which dialect it is assembling for.

use super::{Adapter, AdapterEvent, ChatRequest, ProviderError, TranslatedResponse};
use crate::registry::ToolSpec;
use crate::types::{Content, ContentPart, FinishReason, Message, Role, TokenUsage};
use serde::Deserialize;
use serde_json::json;

pub struct AnthropicAdapter {
    endpoint: String,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
        }
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Anthropic puts the system prompt in a top-level field, not in the
    /// message list (spec §4.5's builder strips `Role::System` before
    /// handing messages to the adapter; this re-derives it defensively in
    /// case a caller forgets to).
    fn extract_system(messages: &[Message]) -> Option<serde_json::Value> {
        let text: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n\n");
        if text.is_empty() {
            None
        } else {
            Some(json!(text))
        }
    }

    fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < messages.len() {
            let m = &messages[i];
            match m.role {
                Role::System => {}
                Role::User => out.push(json!({
                    "role": "user",
                    "content": Self::convert_content(&m.content),
                })),
                Role::Assistant => {
                    let mut blocks = Self::content_blocks(&m.content);
                    if let Some(calls) = &m.tool_calls {
                        for c in calls {
                            let input: serde_json::Value =
                                serde_json::from_str(&c.arguments).unwrap_or(json!({}));
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": c.id,
                                "name": c.name,
                                "input": input,
                            }));
                        }
                    }
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
                Role::Tool => {
                    let tool_use_id = m.tool_call_id.clone().unwrap_or_default();
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": m.content.as_text(),
                    });
                    // Anthropic expects consecutive tool_result blocks
                    // folded into a single user message's content array.
                    if let Some(last) = out.last_mut() {
                        if last["role"] == "user" {
                            if let Some(arr) = last["content"].as_array_mut() {
                                if arr.iter().all(|b| b["type"] == "tool_result") {
                                    arr.push(block);
                                    i += 1;
                                    continue;
                                }
                            }
                        }
                    }
                    out.push(json!({ "role": "user", "content": [block] }));
                }
            }
            i += 1;
        }
        out
    }

    fn content_blocks(content: &Content) -> Vec<serde_json::Value> {
        match content {
            Content::Text(text) if text.is_empty() => Vec::new(),
            Content::Text(text) => vec![json!({ "type": "text", "text": text })],
            Content::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text, cache_control } => {
                        let mut v = json!({ "type": "text", "text": text });
                        if cache_control.is_some() {
                            v["cache_control"] = json!({ "type": "ephemeral" });
                        }
                        v
                    }
                    ContentPart::Image { data, .. } => json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/png",
                            "data": data.clone().unwrap_or_default(),
                        },
                    }),
                })
                .collect(),
        }
    }

    fn convert_content(content: &Content) -> serde_json::Value {
        json!(Self::content_blocks(content))
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect()
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_finish_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

#[async_trait::async_trait]
impl Adapter for AnthropicAdapter {
    fn id(&self) -> &'static str {
        "anthropic"
    }

    fn default_model(&self) -> &'static str {
        "claude-sonnet-4-20250514"
    }

    fn endpoint_url(&self) -> &str {
        &self.endpoint
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ]
    }

    fn supports_reasoning_controls(&self, model: &str) -> bool {
        model.starts_with("claude-sonnet-4") || model.starts_with("claude-opus-4")
    }

    fn supports_prompt_caching(&self, _model: &str) -> bool {
        true
    }

    fn supports_previous_response_id(&self) -> bool {
        false
    }

    fn translate_request(&self, request: &ChatRequest<'_>) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert(
            "messages".to_string(),
            json!(Self::convert_messages(request.messages)),
        );
        body.insert("stream".to_string(), json!(request.stream));
        body.insert("max_tokens".to_string(), json!(4096));

        if let Some(system) = Self::extract_system(request.messages) {
            body.insert("system".to_string(), system);
        }
        if !request.tools.is_empty() {
            body.insert(
                "tools".to_string(),
                json!(Self::convert_tools(request.tools)),
            );
        }
        if self.supports_reasoning_controls(request.model) {
            if let Some(effort) = request.reasoning_effort {
                let budget = match effort {
                    "low" => 2048,
                    "high" => 16384,
                    _ => 8192,
                };
                body.insert(
                    "thinking".to_string(),
                    json!({ "type": "enabled", "budget_tokens": budget }),
                );
            }
        }
        for (key, value) in request.extra {
            body.insert(key.clone(), value.clone());
        }

        serde_json::Value::Object(body)
    }

    fn translate_response(
        &self,
        json: &serde_json::Value,
    ) -> Result<TranslatedResponse, ProviderError> {
        let content_blocks = json["content"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("missing content array".to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in content_blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                Some("tool_use") => {
                    tool_calls.push(crate::types::ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].to_string(),
                    });
                }
                _ => {}
            }
        }

        let finish_reason = json["stop_reason"]
            .as_str()
            .map(parse_finish_reason)
            .unwrap_or(FinishReason::Stop);

        let usage = json
            .get("usage")
            .and_then(|u| serde_json::from_value::<AnthropicUsage>(u.clone()).ok())
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cached_tokens: u.cache_read_input_tokens,
            })
            .unwrap_or_default();

        Ok(TranslatedResponse {
            content: Content::Text(text),
            tool_calls,
            finish_reason,
            usage,
            response_id: json["id"].as_str().map(String::from),
        })
    }

    fn translate_stream_event(
        &self,
        event_name: Option<&str>,
        value: &serde_json::Value,
    ) -> Result<Vec<AdapterEvent>, ProviderError> {
        let event_type = event_name
            .map(str::to_string)
            .or_else(|| value["type"].as_str().map(String::from))
            .unwrap_or_default();

        let mut events = Vec::new();

        match event_type.as_str() {
            "message_start" => {
                if let Some(usage) = value["message"].get("usage") {
                    if let Ok(u) = serde_json::from_value::<AnthropicUsage>(usage.clone()) {
                        events.push(AdapterEvent::Usage(TokenUsage {
                            input_tokens: u.input_tokens,
                            output_tokens: u.output_tokens,
                            cached_tokens: u.cache_read_input_tokens,
                        }));
                    }
                }
            }
            "content_block_start" => {
                let index = value["index"].as_u64().unwrap_or(0) as usize;
                let block = &value["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    events.push(AdapterEvent::ToolCallDelta {
                        index,
                        id: block["id"].as_str().map(String::from),
                        name: block["name"].as_str().map(String::from),
                        arguments_delta: None,
                    });
                }
            }
            "content_block_delta" => {
                let index = value["index"].as_u64().unwrap_or(0) as usize;
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(AdapterEvent::ContentDelta(text.to_string()));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta["thinking"].as_str() {
                            events.push(AdapterEvent::ReasoningDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta["partial_json"].as_str() {
                            events.push(AdapterEvent::ToolCallDelta {
                                index,
                                id: None,
                                name: None,
                                arguments_delta: Some(partial.to_string()),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(stop_reason) = value["delta"]["stop_reason"].as_str() {
                    events.push(AdapterEvent::Done {
                        finish_reason: parse_finish_reason(stop_reason),
                        response_id: None,
                    });
                }
                if let Some(usage) = value.get("usage") {
                    if let Some(output_tokens) = usage["output_tokens"].as_u64() {
                        events.push(AdapterEvent::Usage(TokenUsage {
                            input_tokens: 0,
                            output_tokens: output_tokens as u32,
                            cached_tokens: 0,
                        }));
                    }
                }
            }
            // `content_block_stop`, `message_stop`, `ping`: nothing to emit.
            _ => events.push(AdapterEvent::Ignored),
        }

        Ok(events)
    }
}
