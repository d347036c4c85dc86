//! Querent - a streaming research agent service.
//!
//! Clients POST a query and receive the answer as a stream of typed SSE
//! frames while the engine searches and fetches the web. Sessions carry
//! conversation history and tool quotas across queries and survive restarts
//! through JSON snapshots.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod retry;
pub mod server;
pub mod session;
pub mod store;
pub mod util;

/// Build metadata.
pub mod build_info {
    /// Crate version from Cargo.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
