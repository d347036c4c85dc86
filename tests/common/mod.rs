//! Common test utilities.
//!
//! Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use querent::cache::ResultCache;
use querent::engine::{EngineError, EngineEvent, EngineRequest, EngineStream, QueryEngine};
use querent::retry::RetryPolicy;
use querent::server::{self, AppState, RuntimeServices};
use querent::session::{SessionLimits, SessionRegistry};
use querent::store::{FileSessionStore, SessionStore};

// ============================================================================
// Scripted Engine
// ============================================================================

/// Engine that replays canned event streams, one per invocation.
///
/// Invocations past the end of the list return an immediately finished
/// stream.
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Vec<Result<EngineEvent, EngineError>>>>,
}

impl ScriptedEngine {
    pub fn new(scripts: Vec<Vec<Result<EngineEvent, EngineError>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }
}

#[async_trait]
impl QueryEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, _request: EngineRequest) -> Result<EngineStream, EngineError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Ok(EngineEvent::Done)]);
        Ok(Box::pin(futures::stream::iter(script)))
    }
}

// ============================================================================
// App Builders
// ============================================================================

/// Build an `AppState` over an existing sessions directory.
///
/// Tests that assert on persisted snapshots own the directory and build a
/// second state over it to simulate a restart.
pub fn test_state_in(
    sessions_path: &Path,
    engine: Arc<dyn QueryEngine>,
    limits: SessionLimits,
) -> AppState {
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(sessions_path));
    let search_cache = Arc::new(ResultCache::new(100, Duration::from_secs(1800)));
    let fetch_cache = Arc::new(ResultCache::new(100, Duration::from_secs(3600)));

    // No retries: scripted failures should surface on the first attempt.
    let retry = RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    };

    let registry = SessionRegistry::new(
        engine,
        store,
        Arc::clone(&search_cache),
        Arc::clone(&fetch_cache),
        retry,
        limits,
    );

    AppState {
        services: RuntimeServices {
            registry,
            search_cache,
            fetch_cache,
        },
        keep_alive_interval_seconds: 15,
        max_concurrent_requests: 100,
    }
}

/// Create a test `AppState` with default limits and a throwaway directory.
pub fn test_app_state(engine: Arc<dyn QueryEngine>) -> AppState {
    let tmp = TempDir::new().unwrap();

    // Leak the TempDir so it doesn't get cleaned up during the test.
    let tmp = Box::leak(Box::new(tmp));
    let sessions_path = tmp.path().join("sessions");

    test_state_in(&sessions_path, engine, SessionLimits::default())
}

/// Create a test app driven by the given engine.
pub fn test_app_with_engine(engine: Arc<dyn QueryEngine>) -> Router {
    server::build_app(test_app_state(engine), 300)
}

/// Create a test app whose engine immediately finishes every query.
pub fn test_app() -> Router {
    test_app_with_engine(Arc::new(ScriptedEngine::new(vec![])))
}
