//! V1 API handlers.

mod query;
mod sessions;
mod stats;

pub use query::query;
pub use sessions::{delete_session, get_session, list_sessions};
pub use stats::service_stats;
