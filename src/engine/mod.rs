//! Query-engine abstraction and the Anthropic-backed implementation.
//!
//! The orchestrator only sees [`QueryEngine`]; implementations own the
//! wire protocol. Tool invocations surface as structured
//! [`EngineEvent::ToolUse`] values rather than anything sniffed out of
//! rendered text.

mod anthropic;
mod error;
mod sse;
mod types;

pub use anthropic::{AnthropicEngine, DEFAULT_BASE_URL};
pub use error::EngineError;
pub use types::{EngineEvent, EngineRequest, ToolKind};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// Boxed stream of engine events.
pub type EngineStream = Pin<Box<dyn Stream<Item = Result<EngineEvent, EngineError>> + Send>>;

/// A streaming query-execution engine.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Open one streaming call.
    ///
    /// Events arrive until [`EngineEvent::Done`]; failures after the
    /// stream opens surface as `Err` items within it.
    async fn invoke(&self, request: EngineRequest) -> Result<EngineStream, EngineError>;
}
