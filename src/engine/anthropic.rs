//! Anthropic Messages API adapter.
//!
//! Speaks the streaming Messages endpoint with server-side web tools.
//! The SSE frames are decoded into [`EngineEvent`]s: `text_delta`
//! fragments become [`EngineEvent::Text`], `server_tool_use` blocks
//! become [`EngineEvent::ToolUse`] (the structured tool signal the
//! orchestrator counts), and `message_stop` becomes
//! [`EngineEvent::Done`].

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sse::SseFrameStream;
use super::{EngineError, EngineEvent, EngineRequest, EngineStream, QueryEngine, ToolKind};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";
const WEB_FETCH_BETA: &str = "web-fetch-2025-09-10";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";
const WEB_FETCH_TOOL_TYPE: &str = "web_fetch_20250910";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ============================================================================
// Engine
// ============================================================================

/// Query engine backed by the Anthropic Messages API.
pub struct AnthropicEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    allowed_domains: Vec<String>,
    blocked_domains: Vec<String>,
}

impl AnthropicEngine {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
        }
    }

    /// Override the API origin (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Restrict which domains server-side tools may touch.
    #[must_use]
    pub fn with_domain_filters(mut self, allowed: Vec<String>, blocked: Vec<String>) -> Self {
        self.allowed_domains = allowed;
        self.blocked_domains = blocked;
        self
    }

    fn build_tools(&self, request: &EngineRequest) -> Vec<ToolSpec> {
        request
            .tools
            .iter()
            .map(|kind| {
                let tool_type = match kind {
                    ToolKind::WebSearch => WEB_SEARCH_TOOL_TYPE,
                    ToolKind::WebFetch => WEB_FETCH_TOOL_TYPE,
                };
                ToolSpec {
                    tool_type: tool_type.to_string(),
                    name: kind.as_str().to_string(),
                    max_uses: request.max_tool_uses,
                    allowed_domains: self.allowed_domains.clone(),
                    blocked_domains: self.blocked_domains.clone(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl QueryEngine for AnthropicEngine {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn invoke(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            stream: true,
            messages: vec![WireMessage {
                role: "user",
                content: &request.prompt,
            }],
            tools: self.build_tools(&request),
        };

        let mut http = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);
        if request.tools.contains(&ToolKind::WebFetch) {
            http = http.header("anthropic-beta", WEB_FETCH_BETA);
        }

        let response = http.json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(EngineError::api(status.as_u16(), message));
        }

        debug!(model = %self.model, tools = request.tools.len(), "Engine stream opened");
        Ok(Box::pin(AnthropicEventStream::new(response.bytes_stream())))
    }
}

// ============================================================================
// Request Wire Format
// ============================================================================

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ToolSpec {
    #[serde(rename = "type")]
    tool_type: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_uses: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    allowed_domains: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocked_domains: Vec<String>,
}

// ============================================================================
// Stream Wire Format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    ContentBlockStart { content_block: ContentBlock },
    ContentBlockDelta { delta: Delta },
    MessageStop,
    Error { error: WireError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ServerToolUse { name: String },
    ToolUse { name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl WireError {
    fn into_engine_error(self) -> EngineError {
        let status = match self.kind.as_str() {
            "rate_limit_error" => Some(429),
            "overloaded_error" => Some(529),
            "api_error" => Some(500),
            _ => None,
        };
        match status {
            Some(status) => EngineError::api(status, self.message),
            None => EngineError::stream(format!("{}: {}", self.kind, self.message)),
        }
    }
}

// ============================================================================
// Event Adapter
// ============================================================================

/// Decodes the Anthropic SSE stream into [`EngineEvent`]s.
struct AnthropicEventStream<S> {
    frames: SseFrameStream<S>,
    done: bool,
}

impl<S> AnthropicEventStream<S> {
    fn new(inner: S) -> Self {
        Self {
            frames: SseFrameStream::new(inner),
            done: false,
        }
    }
}

impl<S> Stream for AnthropicEventStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<EngineEvent, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut self.frames).poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if frame.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WireEvent>(&frame.data) {
                        Ok(WireEvent::ContentBlockStart { content_block }) => {
                            match content_block {
                                ContentBlock::ServerToolUse { name }
                                | ContentBlock::ToolUse { name } => {
                                    match ToolKind::from_engine_name(&name) {
                                        Some(kind) => {
                                            return Poll::Ready(Some(Ok(EngineEvent::ToolUse(
                                                kind,
                                            ))));
                                        }
                                        None => {
                                            debug!(tool = %name, "Ignoring unrecognized tool block");
                                        }
                                    }
                                }
                                ContentBlock::Other => {}
                            }
                        }
                        Ok(WireEvent::ContentBlockDelta { delta }) => {
                            if let Delta::TextDelta { text } = delta {
                                if !text.is_empty() {
                                    return Poll::Ready(Some(Ok(EngineEvent::Text(text))));
                                }
                            }
                        }
                        Ok(WireEvent::MessageStop) => {
                            self.done = true;
                            return Poll::Ready(Some(Ok(EngineEvent::Done)));
                        }
                        Ok(WireEvent::Error { error }) => {
                            self.done = true;
                            return Poll::Ready(Some(Err(error.into_engine_error())));
                        }
                        Ok(WireEvent::Other) => {}
                        Err(e) => {
                            self.done = true;
                            return Poll::Ready(Some(Err(EngineError::stream(format!(
                                "undecodable frame: {e}"
                            )))));
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(EngineError::Request(e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
