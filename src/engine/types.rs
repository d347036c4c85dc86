//! Request and event types shared by every engine implementation.

use serde::{Deserialize, Serialize};

// ============================================================================
// Tools
// ============================================================================

/// Server-side tools a query may use.
///
/// The wire names (`web_search`, `web_fetch`) appear both in engine
/// requests and in the client-facing event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    WebSearch,
    WebFetch,
}

impl ToolKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::WebFetch => "web_fetch",
        }
    }

    /// Parse an engine-side tool name; unknown names are `None`.
    #[must_use]
    pub fn from_engine_name(name: &str) -> Option<Self> {
        match name {
            "web_search" => Some(Self::WebSearch),
            "web_fetch" => Some(Self::WebFetch),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests and Events
// ============================================================================

/// One streaming request to the engine.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Prompt for this call.
    pub prompt: String,
    /// Server-side tools the engine may invoke.
    pub tools: Vec<ToolKind>,
    /// Cap on tool invocations the engine may spend on this call.
    pub max_tool_uses: Option<u32>,
}

impl EngineRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            tools: Vec::new(),
            max_tool_uses: None,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolKind>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_max_tool_uses(mut self, max: u32) -> Self {
        self.max_tool_uses = Some(max);
        self
    }
}

/// One event from an engine stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A fragment of assistant text.
    Text(String),
    /// The engine started a server-side tool invocation.
    ToolUse(ToolKind),
    /// The stream completed normally.
    Done,
}

// ============================================================================
// Tests
// ============================================================================
