//! OpenAI Chat Completions adapter.
//!
//! Grounded on `llm/openai.rs`'s wire types and `convert_message`/
//! `convert_tools`, minus its own `chat`/`chat_loop` background task (that
//! loop now lives in [`crate::orchestrator`]). Tool-call deltas are keyed
//! by `index` (the teacher's `tool_call_index_to_id` lookup table is
//! exactly this, generalised into [`crate::assembler::ToolCallAssembler`]).

use super::{Adapter, AdapterEvent, ChatRequest, ProviderError, TranslatedResponse};
use crate::registry::ToolSpec;
use crate::types::{Content, ContentPart, FinishReason, Message, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub struct OpenAiAdapter {
    endpoint: String,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn convert_message(message: &Message) -> serde_json::Value {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        if message.role == Role::Tool {
            return json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.content.as_text(),
            });
        }

        let mut obj = serde_json::Map::new();
        obj.insert("role".to_string(), json!(role));
        obj.insert("content".to_string(), Self::convert_content(&message.content));

        if let Some(calls) = &message.tool_calls {
            if !calls.is_empty() {
                let wire_calls: Vec<_> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                obj.insert("tool_calls".to_string(), json!(wire_calls));
            }
        }

        serde_json::Value::Object(obj)
    }

    fn convert_content(content: &Content) -> serde_json::Value {
        match content {
            Content::Text(text) => json!(text),
            Content::Parts(parts) => {
                let wire_parts: Vec<_> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text, cache_control } => {
                            let mut v = json!({ "type": "text", "text": text });
                            if cache_control.is_some() {
                                v["cache_control"] = json!({ "type": "ephemeral" });
                            }
                            v
                        }
                        ContentPart::Image { url, .. } => json!({
                            "type": "image_url",
                            "image_url": { "url": url.clone().unwrap_or_default() },
                        }),
                    })
                    .collect();
                json!(wire_parts)
            }
        }
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize, Serialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

fn finish_reason_from_str(s: &str) -> FinishReason {
    match s {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

#[async_trait::async_trait]
impl Adapter for OpenAiAdapter {
    fn id(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &'static str {
        "gpt-4o"
    }

    fn endpoint_url(&self) -> &str {
        &self.endpoint
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("Authorization".to_string(), format!("Bearer {}", api_key))]
    }

    fn supports_reasoning_controls(&self, model: &str) -> bool {
        model.starts_with("gpt-5") || model.starts_with("o1") || model.starts_with("o3")
    }

    fn supports_prompt_caching(&self, _model: &str) -> bool {
        // OpenAI caches automatically server-side; no explicit marker needed,
        // but the engine still attaches one uniformly (spec §4.10) and this
        // dialect simply ignores it on the wire.
        false
    }

    fn supports_previous_response_id(&self) -> bool {
        false
    }

    fn translate_request(&self, request: &ChatRequest<'_>) -> serde_json::Value {
        let mut messages: Vec<_> = request.messages.iter().map(Self::convert_message).collect();

        // Tool-result follow-up messages for assistant tool_calls already
        // flow through the builder as role=tool messages (spec §4.5); the
        // assistant message carrying tool_calls precedes them there.
        if messages.is_empty() {
            messages.push(json!({ "role": "user", "content": "" }));
        }

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert("messages".to_string(), json!(messages));
        body.insert("stream".to_string(), json!(request.stream));
        if request.stream {
            body.insert(
                "stream_options".to_string(),
                json!({ "include_usage": true }),
            );
        }
        if !request.tools.is_empty() {
            body.insert("tools".to_string(), json!(Self::convert_tools(request.tools)));
        }
        if self.supports_reasoning_controls(request.model) {
            if let Some(effort) = request.reasoning_effort {
                body.insert("reasoning_effort".to_string(), json!(effort));
            }
            if let Some(verbosity) = request.verbosity {
                body.insert("verbosity".to_string(), json!(verbosity));
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
        let chunk: ChatCompletionChunk = serde_json::from_value(json.clone())?;
        let choice = chunk
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".to_string()))?;

        let content = Content::Text(choice.delta.content.unwrap_or_default());
        let finish_reason = choice
            .finish_reason
            .as_deref()
            .map(finish_reason_from_str)
            .unwrap_or(FinishReason::Stop);
        let usage = chunk
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                cached_tokens: u
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(TranslatedResponse {
            content,
            tool_calls: Vec::new(),
            finish_reason,
            usage,
            response_id: chunk.id,
        })
    }

    fn translate_stream_event(
        &self,
        _event_name: Option<&str>,
        value: &serde_json::Value,
    ) -> Result<Vec<AdapterEvent>, ProviderError> {
        let chunk: ChatCompletionChunk = serde_json::from_value(value.clone())?;
        let mut events = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    events.push(AdapterEvent::ContentDelta(text));
                }
            }
            if let Some(text) = choice.delta.reasoning_content {
                if !text.is_empty() {
                    events.push(AdapterEvent::ReasoningDelta(text));
                }
            }
            if let Some(deltas) = choice.delta.tool_calls {
                for d in deltas {
                    events.push(AdapterEvent::ToolCallDelta {
                        index: d.index,
                        id: d.id,
                        name: d.function.as_ref().and_then(|f| f.name.clone()),
                        arguments_delta: d.function.and_then(|f| f.arguments),
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                events.push(AdapterEvent::Done {
                    finish_reason: finish_reason_from_str(&reason),
                    response_id: chunk.id.clone(),
                });
            }
        }

        if let Some(usage) = chunk.usage {
            events.push(AdapterEvent::Usage(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cached_tokens: usage
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
            }));
        }

        Ok(events)
    }
}
