//! The downstream HTTP surface (spec §6) — grounded on
//! `other_examples/…mira-chat…/server.rs`'s `chat_stream_handler`/
//! `chat_sync_handler` split: one handler spawns the turn onto a channel
//! and either re-renders that channel as SSE or drains it into one JSON
//! body, depending on what the caller asked for.

use crate::abort::{AbortCoordinator, AbortReason};
use crate::adapter::Adapter;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http_client::HttpClient;
use crate::orchestrator::{self, TurnRequest, TurnSummary};
use crate::persistence::Persistence;
use crate::registry::ToolRegistry;
use crate::stream::{self, WireFrame};
use crate::types::{Content, Conversation, ConversationSettings, ExtraOptions, Message, MessageStatus, Role, ToolCall};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Shared server state, constructed once in `main` and cloned per request
/// (everything behind an `Arc` or already cheap to clone).
#[derive(Clone)]
pub struct AppState {
    pub adapters: Arc<HashMap<String, Arc<dyn Adapter>>>,
    pub api_keys: Arc<HashMap<String, String>>,
    pub default_provider: String,
    pub tools: ToolRegistry,
    pub http: Arc<HttpClient>,
    pub persistence: Arc<dyn Persistence>,
    pub config: GatewayConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// One message of the request body's `messages` array. `content` and
/// `tool_calls` reuse the engine's own wire types directly (spec §6's
/// request body is "an OpenAI-compatible chat completion object
/// extended with ...", and those types already speak that dialect).
#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: Role,
    #[serde(default)]
    content: Content,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    provider_id: Option<String>,
    #[serde(default)]
    previous_response_id: Option<String>,
    /// Accepted per spec §6; tool-bearing requests already run the
    /// iterative loop unconditionally, so this only documents intent.
    #[serde(default)]
    #[allow(dead_code)]
    research_mode: Option<bool>,
    #[serde(default = "default_true")]
    stream: bool,
    #[serde(default)]
    provider_stream: Option<bool>,
    /// Registered tool names to activate for this turn (spec §6's
    /// "array of registered tool names" form — see DESIGN.md for the
    /// scope note on the full-spec-array alternative).
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    enable_parallel_tool_calls: Option<bool>,
    #[serde(default)]
    parallel_tool_concurrency: Option<usize>,
    #[serde(default)]
    reasoning_effort: Option<String>,
    #[serde(default)]
    verbosity: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    active_system_prompt_id: Option<String>,
    #[serde(default)]
    extra: ExtraOptions,
}

fn default_true() -> bool {
    true
}

struct ApiError(GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_body())).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<axum::response::Response, ApiError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".to_string()).into());
    }

    let provider_id = header_str(&headers, "x-provider-id")
        .map(str::to_string)
        .or_else(|| request.provider_id.clone())
        .unwrap_or_else(|| state.default_provider.clone());

    let adapter = state
        .adapters
        .get(&provider_id)
        .cloned()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown provider_id: {provider_id}")))?;

    let api_key = state
        .api_keys
        .get(&provider_id)
        .cloned()
        .ok_or_else(|| GatewayError::InvalidConfig(format!("no api key configured for provider {provider_id}")))?;

    let conversation_id = header_str(&headers, "x-conversation-id")
        .map(str::to_string)
        .or_else(|| request.conversation_id.clone());

    state.persistence.ensure_session("default").await.map_err(|e| GatewayError::Internal(e.to_string()))?;
    state.persistence.check_limits("default").await.map_err(|e| {
        if matches!(e, crate::persistence::PersistenceError::LimitExceeded(_)) {
            GatewayError::LimitExceeded(e.to_string())
        } else {
            GatewayError::Internal(e.to_string())
        }
    })?;

    let conversation = state
        .persistence
        .resolve_or_create_conversation(
            "default",
            conversation_id.as_deref(),
            &request.model,
            &provider_id,
            ConversationSettings {
                active_tool_names: request.tools.clone(),
                tools_enabled: !request.tools.is_empty(),
                reasoning_effort: request.reasoning_effort.clone(),
                verbosity: request.verbosity.clone(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    // Persistence's own recorded response_id (builder.rs) is authoritative
    // once a conversation has history; an explicitly supplied
    // `x-previous-response-id`/`previous_response_id` only matters for a
    // conversation's first turn, which `build_turn` already handles by
    // finding no prior id and rehydrating instead.
    let _previous_response_id_override = header_str(&headers, "x-previous-response-id")
        .map(str::to_string)
        .or_else(|| request.previous_response_id.clone());

    let new_messages: Vec<Message> = request
        .messages
        .into_iter()
        .map(|m| Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            seq: 0,
            role: m.role,
            content: m.content,
            tool_call_id: m.tool_call_id,
            tool_calls: m.tool_calls,
            tool_outputs: None,
            finish_reason: None,
            status: MessageStatus::Final,
            response_id: None,
            reasoning_details: None,
            reasoning_tokens: None,
        })
        .collect();

    let provider_stream = request.provider_stream.unwrap_or(request.stream);

    let turn_request = TurnRequest {
        conversation: conversation.clone(),
        api_key,
        new_messages,
        system_prompt: request.system_prompt,
        tools_enabled: !request.tools.is_empty(),
        active_tool_names: request.tools,
        provider_stream,
        enable_parallel_tool_calls: request.enable_parallel_tool_calls,
        parallel_tool_concurrency: request.parallel_tool_concurrency,
        reasoning_effort: request.reasoning_effort,
        verbosity: request.verbosity,
        max_iterations: None,
        extra: request.extra,
    };

    let abort = AbortCoordinator::new();
    abort.arm_timeout(state.config.turn_timeout_ms.map(Duration::from_millis));
    let (writer, reader) = stream::channel(64);

    let adapter_for_task = adapter.clone();
    let tools_for_task = state.tools.clone();
    let http_for_task = state.http.clone();
    let persistence_for_task = state.persistence.clone();
    let config_for_task = state.config.clone();
    let abort_for_task = abort.clone();

    let handle = tokio::spawn(async move {
        orchestrator::run_turn(
            adapter_for_task.as_ref(),
            &tools_for_task,
            &http_for_task,
            Some(persistence_for_task.as_ref()),
            &config_for_task,
            &abort_for_task,
            &writer,
            turn_request,
        )
        .await
    });

    if request.stream {
        Ok(stream_response(reader, handle, abort).await)
    } else {
        json_response(reader, handle, abort).await
    }
}

/// Render the turn onto an SSE response; the client disconnecting drops
/// `reader`, which the writer observes on its next `send_event` and uses
/// to abort the turn (spec §4.8/§4.11).
async fn stream_response(
    mut reader: crate::stream::StreamReader,
    handle: tokio::task::JoinHandle<Result<TurnSummary, GatewayError>>,
    abort: AbortCoordinator,
) -> axum::response::Response {
    let sse_stream = async_stream::stream! {
        while let Some(frame) = reader.recv().await {
            yield Ok::<Event, Infallible>(Event::default().data(frame.data()));
            if matches!(frame, WireFrame::Done) {
                break;
            }
        }
        drop(abort);
        let _ = handle.await;
    };

    let sse: Sse<std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>> =
        Sse::new(Box::pin(sse_stream)).keep_alive(KeepAlive::default());
    sse.into_response()
}

/// Drain the whole turn into one JSON body (spec §6 `stream=false`).
async fn json_response(
    mut reader: crate::stream::StreamReader,
    handle: tokio::task::JoinHandle<Result<TurnSummary, GatewayError>>,
    abort: AbortCoordinator,
) -> Result<axum::response::Response, ApiError> {
    while reader.recv().await.is_some() {}
    drop(abort);

    let summary = handle
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))??;

    if summary.status == MessageStatus::Error {
        return Err(GatewayError::UpstreamError(crate::adapter::ProviderError::InvalidResponse(summary.content)).into());
    }

    let body = json!({
        "id": summary.assistant_message_id,
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": summary.content,
            },
            "finish_reason": summary.finish_reason.as_str(),
        }],
        "usage": {
            "prompt_tokens": summary.usage.input_tokens,
            "completion_tokens": summary.usage.output_tokens,
            "total_tokens": summary.usage.total(),
        },
        "tool_events": summary.tool_events,
        "_conversation": {
            "id": summary.conversation_id,
            "seq": summary.seq,
        },
    });

    Ok(Json(body).into_response())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}
