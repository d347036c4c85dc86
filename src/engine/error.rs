//! Engine error types and their retry classification.

use thiserror::Error;

use crate::retry::is_retryable_status;

/// Failure talking to the query engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The engine answered with a non-success status.
    #[error("engine API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The stream broke or produced an undecodable frame.
    #[error("engine stream error: {0}")]
    Stream(String),

    /// No output arrived within the idle window.
    #[error("engine stream idle for {0} seconds")]
    IdleTimeout(u64),
}

impl EngineError {
    pub(crate) fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Rate limiting, server errors, stalled streams, and transport
    /// timeouts are transient. Auth failures and malformed requests are
    /// permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => is_retryable_status(*status),
            Self::Stream(_) => false,
            Self::IdleTimeout(_) => true,
        }
    }
}
