//! Session snapshot persistence.
//!
//! Snapshots are whole-document JSON files written atomically
//! (temp file + rename). The trait keeps the registry backend-agnostic.

mod error;
mod file;
mod session;

pub use error::{StorageError, StorageResult};
pub use file::FileSessionStore;
pub use session::SessionStore;
