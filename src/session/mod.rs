//! Session management for Querent.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────────┐         ┌─────────────────────┐
//!  │ SessionRegistry │──owns───▶ SessionOrchestrator │  (one per session)
//!  │ (ID → Arc<..>)  │         │  owns AgentSession, │
//!  └────────┬────────┘         │  serializes queries │
//!           │                  │  behind an async    │
//!           │ get_or_create    │  lock               │
//!           ▼                  └──────────┬──────────┘
//!  ┌─────────────────┐                    │ bounded mpsc
//!  │    handlers     │◀───StreamEvent─────┘
//!  └─────────────────┘
//! ```
//!
//! - **AgentSession** — transcript, tool counters, and query phase; the
//!   same struct is serialized as the on-disk snapshot.
//! - **SessionOrchestrator** — runs queries against the engine, owns the
//!   per-session query lock, and persists snapshots as state changes.
//! - **SessionRegistry** — maps session ids to orchestrators; resumes
//!   persisted sessions lazily and generates ids for fresh ones.

mod events;
mod orchestrator;
mod registry;
mod state;

pub use events::{QueryStatus, StreamEvent};
pub use orchestrator::{
    MAX_QUERY_CHARS, QueryError, QueryStream, SessionLimits, SessionOrchestrator,
};
pub use registry::{AggregateStats, SessionRegistry};
pub use state::{AgentSession, Message, QueryPhase, Role, SessionStats};
