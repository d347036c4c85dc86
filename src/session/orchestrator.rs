//! Per-session query orchestration.
//!
//! One orchestrator owns one session. Queries on the same session are
//! serialized behind an async lock; events flow to the client through a
//! bounded channel so a slow consumer backpressures the engine instead
//! of buffering unbounded output.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::cache::{fingerprint, ResultCache};
use crate::engine::{EngineError, EngineEvent, EngineRequest, QueryEngine, ToolKind};
use crate::retry::{RetryError, RetryPolicy};
use crate::session::events::StreamEvent;
use crate::session::state::{AgentSession, QueryPhase, Role};
use crate::session::SessionStats;
use crate::store::SessionStore;
use crate::util::{format_duration, truncate_for_log};

/// Longest accepted query, in characters.
pub const MAX_QUERY_CHARS: usize = 10_000;

/// Events buffered between producer and consumer before sends block.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Stream of client events for one query.
pub type QueryStream = ReceiverStream<StreamEvent>;

// ============================================================================
// Errors
// ============================================================================

/// Why an operation was rejected or failed.
///
/// `Validation` and `QuotaExceeded` are raised before any event is
/// emitted or any state is mutated. Engine failures inside a running
/// query surface as `error` stream events instead.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Malformed input; nothing happened.
    #[error("invalid query: {0}")]
    Validation(String),

    /// The session's search budget is spent.
    #[error("search quota exhausted: {used} of {max} searches used")]
    QuotaExceeded { used: u32, max: u32 },

    /// The engine could not be dispatched, retries included.
    #[error(transparent)]
    Engine(#[from] RetryError<EngineError>),

    /// The engine stream broke after a successful dispatch.
    #[error(transparent)]
    Stream(EngineError),
}

// ============================================================================
// Limits
// ============================================================================

/// Execution limits shared by every session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Web searches allowed per session.
    pub max_searches: u32,
    /// Longest silence tolerated between engine events.
    pub idle_timeout: Duration,
    /// Tools offered to the engine.
    pub tools: Vec<ToolKind>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_searches: 10,
            idle_timeout: Duration::from_secs(60),
            tools: vec![ToolKind::WebSearch, ToolKind::WebFetch],
        }
    }
}

// ============================================================================
// SessionOrchestrator
// ============================================================================

/// Executes queries for one session.
pub struct SessionOrchestrator {
    session_id: String,
    state: RwLock<AgentSession>,
    query_lock: Arc<tokio::sync::Mutex<()>>,
    engine: Arc<dyn QueryEngine>,
    store: Arc<dyn SessionStore>,
    search_cache: Arc<ResultCache>,
    fetch_cache: Arc<ResultCache>,
    retry: RetryPolicy,
    limits: SessionLimits,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(
        session: AgentSession,
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn SessionStore>,
        search_cache: Arc<ResultCache>,
        fetch_cache: Arc<ResultCache>,
        retry: RetryPolicy,
        limits: SessionLimits,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            state: RwLock::new(session),
            query_lock: Arc::new(tokio::sync::Mutex::new(())),
            engine,
            store,
            search_cache,
            fetch_cache,
            retry,
            limits,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.state
            .read()
            .expect("session state lock poisoned")
            .started_at
    }

    #[must_use]
    pub fn phase(&self) -> QueryPhase {
        self.state
            .read()
            .expect("session state lock poisoned")
            .phase
    }

    /// Current stats; never touches the query lock.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.state
            .read()
            .expect("session state lock poisoned")
            .stats(self.limits.max_searches)
    }

    // ------------------------------------------------------------------------
    // Streaming queries
    // ------------------------------------------------------------------------

    /// Run one streaming query.
    ///
    /// Returns the event stream once the query is admitted. The session's
    /// query lock is held by the producer until the stream finishes or
    /// the consumer drops it, so queries on one session never interleave.
    pub async fn run_query(
        self: Arc<Self>,
        prompt: impl Into<String>,
    ) -> Result<QueryStream, QueryError> {
        // The guard moves into the producer task below; dropping the
        // stream tears the producer down and releases it.
        let guard = Arc::clone(&self.query_lock).lock_owned().await;

        let prompt = validate_query(prompt.into())?;

        {
            let state = self.state.read().expect("session state lock poisoned");
            if !state.can_search(self.limits.max_searches) {
                return Err(QueryError::QuotaExceeded {
                    used: state.web_searches_used,
                    max: self.limits.max_searches,
                });
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Arc::clone(&self);
        tokio::spawn(async move {
            let _guard = guard;
            orchestrator.produce_events(prompt, tx).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn produce_events(&self, prompt: String, tx: mpsc::Sender<StreamEvent>) {
        let query_started = std::time::Instant::now();

        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.push_message(Role::User, prompt.clone());
            state.phase = QueryPhase::Dispatched;
        }
        self.persist_snapshot().await;

        if tx
            .send(StreamEvent::session_started(&self.session_id))
            .await
            .is_err()
        {
            self.client_gone().await;
            return;
        }

        info!(
            session_id = %self.session_id,
            engine = self.engine.name(),
            prompt = %truncate_for_log(&prompt, 80),
            "Query dispatched"
        );

        let remaining_searches = {
            let state = self.state.read().expect("session state lock poisoned");
            self.limits.max_searches.saturating_sub(state.web_searches_used)
        };
        let request = EngineRequest::new(prompt)
            .with_tools(self.limits.tools.clone())
            .with_max_tool_uses(remaining_searches);

        let stream = match self.dispatch(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&tx, e.to_string()).await;
                return;
            }
        };

        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.phase = QueryPhase::Streaming;
        }

        let stream = stream.timeout(self.limits.idle_timeout);
        tokio::pin!(stream);
        let mut seen_tools: Vec<ToolKind> = Vec::new();
        let mut answer = String::new();

        while let Some(step) = stream.next().await {
            match step {
                Ok(Ok(EngineEvent::Text(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    answer.push_str(&text);
                    if tx.send(StreamEvent::text(text)).await.is_err() {
                        self.client_gone().await;
                        return;
                    }
                }
                Ok(Ok(EngineEvent::ToolUse(tool))) => {
                    // Only the first observation of a tool kind per query
                    // counts and emits; the engine reports repeats.
                    if seen_tools.contains(&tool) {
                        continue;
                    }
                    seen_tools.push(tool);
                    {
                        let mut state =
                            self.state.write().expect("session state lock poisoned");
                        state.record_tool_use(tool);
                    }
                    debug!(session_id = %self.session_id, tool = %tool, "Tool invoked");
                    if tx.send(StreamEvent::tool(tool)).await.is_err() {
                        self.client_gone().await;
                        return;
                    }
                }
                Ok(Ok(EngineEvent::Done)) => break,
                Ok(Err(e)) => {
                    self.fail(&tx, e.to_string()).await;
                    return;
                }
                Err(_elapsed) => {
                    let e = EngineError::IdleTimeout(self.limits.idle_timeout.as_secs());
                    self.fail(&tx, e.to_string()).await;
                    return;
                }
            }
        }

        let stats = {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.push_message(Role::Assistant, answer);
            state.phase = QueryPhase::Completed;
            state.stats(self.limits.max_searches)
        };
        self.persist_snapshot().await;

        info!(
            session_id = %self.session_id,
            searches = stats.web_searches_used,
            fetches = stats.web_fetches_used,
            duration = %format_duration(query_started.elapsed().as_secs_f64()),
            "Query completed"
        );
        let _ = tx.send(StreamEvent::complete(stats)).await;
    }

    /// Open the engine stream, retrying transient dispatch failures.
    async fn dispatch(
        &self,
        request: EngineRequest,
    ) -> Result<crate::engine::EngineStream, RetryError<EngineError>> {
        let engine = Arc::clone(&self.engine);
        self.retry
            .execute(
                || {
                    let engine = Arc::clone(&engine);
                    let request = request.clone();
                    async move { engine.invoke(request).await }
                },
                EngineError::is_transient,
            )
            .await
    }

    async fn fail(&self, tx: &mpsc::Sender<StreamEvent>, message: String) {
        error!(session_id = %self.session_id, error = %message, "Query failed");
        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.phase = QueryPhase::Failed;
        }
        self.persist_snapshot().await;
        let _ = tx
            .send(StreamEvent::error(message, self.session_id.as_str()))
            .await;
    }

    async fn client_gone(&self) {
        debug!(session_id = %self.session_id, "Client disconnected, abandoning query");
        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.phase = QueryPhase::Idle;
        }
        self.persist_snapshot().await;
    }

    /// Best-effort snapshot write; failures are logged, never fatal.
    async fn persist_snapshot(&self) {
        let snapshot = self
            .state
            .read()
            .expect("session state lock poisoned")
            .clone();
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!(
                session_id = %self.session_id,
                error = %e,
                "Failed to persist session snapshot"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Cached one-shot operations
    // ------------------------------------------------------------------------

    /// Run a one-shot web search through the result cache.
    ///
    /// A cache hit returns immediately and consumes no quota. A miss runs
    /// a single engine call with only the search tool enabled and caches
    /// the final text.
    pub async fn search(&self, query: &str) -> Result<String, QueryError> {
        let key = fingerprint("search", &json!({ "query": query }));
        if let Some(cached) = self.search_cache.get(&key) {
            debug!(session_id = %self.session_id, "Search served from cache");
            return Ok(cached);
        }

        let _guard = self.query_lock.lock().await;

        {
            let state = self.state.read().expect("session state lock poisoned");
            if !state.can_search(self.limits.max_searches) {
                return Err(QueryError::QuotaExceeded {
                    used: state.web_searches_used,
                    max: self.limits.max_searches,
                });
            }
        }

        let request = EngineRequest::new(format!("Search the web for: {query}"))
            .with_tools(vec![ToolKind::WebSearch])
            .with_max_tool_uses(1);
        let result = self.run_tool_call(request).await?;

        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.record_tool_use(ToolKind::WebSearch);
        }
        self.persist_snapshot().await;
        self.search_cache.set(key, result.clone());
        Ok(result)
    }

    /// Fetch a page through the result cache.
    ///
    /// Fetches are not quota-limited; only the per-session counter moves.
    pub async fn fetch(&self, url: &str) -> Result<String, QueryError> {
        let key = fingerprint("fetch", &json!({ "url": url }));
        if let Some(cached) = self.fetch_cache.get(&key) {
            debug!(session_id = %self.session_id, "Fetch served from cache");
            return Ok(cached);
        }

        let _guard = self.query_lock.lock().await;

        let request = EngineRequest::new(format!("Fetch the content of: {url}"))
            .with_tools(vec![ToolKind::WebFetch])
            .with_max_tool_uses(1);
        let result = self.run_tool_call(request).await?;

        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.record_tool_use(ToolKind::WebFetch);
        }
        self.persist_snapshot().await;
        self.fetch_cache.set(key, result.clone());
        Ok(result)
    }

    /// Drive one engine call to completion and collect its text.
    async fn run_tool_call(&self, request: EngineRequest) -> Result<String, QueryError> {
        let stream = self.dispatch(request).await?;

        let stream = stream.timeout(self.limits.idle_timeout);
        tokio::pin!(stream);
        let mut text = String::new();
        while let Some(step) = stream.next().await {
            match step {
                Ok(Ok(EngineEvent::Text(chunk))) => text.push_str(&chunk),
                Ok(Ok(EngineEvent::ToolUse(_))) => {}
                Ok(Ok(EngineEvent::Done)) => break,
                Ok(Err(e)) => return Err(QueryError::Stream(e)),
                Err(_elapsed) => {
                    return Err(QueryError::Stream(EngineError::IdleTimeout(
                        self.limits.idle_timeout.as_secs(),
                    )));
                }
            }
        }
        Ok(text)
    }
}

fn validate_query(prompt: String) -> Result<String, QueryError> {
    if prompt.trim().is_empty() {
        return Err(QueryError::Validation("query must not be empty".to_string()));
    }
    if prompt.chars().count() > MAX_QUERY_CHARS {
        return Err(QueryError::Validation(format!(
            "query exceeds {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(prompt)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::testing::{MemoryStore, Script, ScriptedEngine};

    fn build(
        engine: Arc<ScriptedEngine>,
        store: Arc<MemoryStore>,
        session: AgentSession,
        limits: SessionLimits,
    ) -> Arc<SessionOrchestrator> {
        let engine_dyn: Arc<dyn QueryEngine> = engine;
        let store_dyn: Arc<dyn SessionStore> = store;
        Arc::new(SessionOrchestrator::new(
            session,
            engine_dyn,
            store_dyn,
            Arc::new(ResultCache::new(100, Duration::from_secs(300))),
            Arc::new(ResultCache::new(100, Duration::from_secs(300))),
            RetryPolicy::no_retries(),
            limits,
        ))
    }

    fn orchestrator(engine: ScriptedEngine) -> (Arc<SessionOrchestrator>, Arc<ScriptedEngine>) {
        let engine = Arc::new(engine);
        let orch = build(
            Arc::clone(&engine),
            Arc::new(MemoryStore::default()),
            AgentSession::new("session_test"),
            SessionLimits::default(),
        );
        (orch, engine)
    }

    async fn collect(stream: QueryStream) -> Vec<StreamEvent> {
        stream.collect::<Vec<_>>().await
    }

    #[tokio::test]
    async fn streams_events_in_order() {
        let (orch, _) = orchestrator(ScriptedEngine::streaming(vec![
            Ok(EngineEvent::Text("The".to_string())),
            Ok(EngineEvent::Text(" answer".to_string())),
            Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
            Ok(EngineEvent::Done),
        ]));

        let events = collect(orch.clone().run_query("what is rust?").await.unwrap()).await;

        assert!(matches!(events[0], StreamEvent::Session { .. }));
        assert!(matches!(&events[1], StreamEvent::Text { content } if content == "The"));
        assert!(matches!(&events[2], StreamEvent::Text { content } if content == " answer"));
        assert!(matches!(events[3], StreamEvent::Tool { tool: ToolKind::WebSearch }));
        match &events[4] {
            StreamEvent::Complete { session_stats } => {
                assert_eq!(session_stats.web_searches_used, 1);
                assert_eq!(session_stats.message_count, 2);
            }
            other => panic!("expected complete, got {other:?}"),
        }
        assert_eq!(events.len(), 5);
        assert_eq!(orch.phase(), QueryPhase::Completed);
    }

    #[tokio::test]
    async fn duplicate_tool_kinds_count_once_per_query() {
        let (orch, _) = orchestrator(ScriptedEngine::streaming(vec![
            Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
            Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
            Ok(EngineEvent::ToolUse(ToolKind::WebFetch)),
            Ok(EngineEvent::Done),
        ]));

        let events = collect(orch.clone().run_query("q").await.unwrap()).await;

        let tool_events = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Tool { .. }))
            .count();
        assert_eq!(tool_events, 2);

        let stats = orch.stats();
        assert_eq!(stats.web_searches_used, 1);
        assert_eq!(stats.web_fetches_used, 1);
    }

    #[tokio::test]
    async fn blank_query_is_rejected_without_side_effects() {
        let (orch, engine) = orchestrator(ScriptedEngine::streaming(vec![]));

        let err = orch.clone().run_query("   \n ").await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));
        assert_eq!(engine.invocation_count(), 0);
        assert_eq!(orch.stats().message_count, 0);
    }

    #[tokio::test]
    async fn overlong_query_is_rejected() {
        let (orch, _) = orchestrator(ScriptedEngine::streaming(vec![]));

        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        let err = orch.clone().run_query(long).await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));
    }

    #[tokio::test]
    async fn exhausted_quota_rejects_before_the_engine_is_touched() {
        let engine = Arc::new(ScriptedEngine::streaming(vec![Ok(EngineEvent::Done)]));
        let mut session = AgentSession::new("session_full");
        session.web_searches_used = 1;
        let orch = build(
            Arc::clone(&engine),
            Arc::new(MemoryStore::default()),
            session,
            SessionLimits {
                max_searches: 1,
                ..SessionLimits::default()
            },
        );

        let err = orch.clone().run_query("one more").await.unwrap_err();
        assert!(matches!(err, QueryError::QuotaExceeded { used: 1, max: 1 }));
        assert_eq!(engine.invocation_count(), 0);
        assert_eq!(orch.stats().message_count, 0);
    }

    #[tokio::test]
    async fn mid_stream_engine_error_becomes_an_error_event() {
        let (orch, _) = orchestrator(ScriptedEngine::streaming(vec![
            Ok(EngineEvent::Text("partial".to_string())),
            Err(EngineError::stream("wire cut")),
        ]));

        let events = collect(orch.clone().run_query("q").await.unwrap()).await;

        assert!(matches!(events[0], StreamEvent::Session { .. }));
        assert!(matches!(&events[1], StreamEvent::Text { content } if content == "partial"));
        match &events[2] {
            StreamEvent::Error { error, session_id } => {
                assert!(error.contains("wire cut"));
                assert_eq!(session_id, "session_test");
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(events.len(), 3);
        assert_eq!(orch.phase(), QueryPhase::Failed);

        // The user message stays; no assistant message was appended.
        assert_eq!(orch.stats().message_count, 1);
    }

    #[tokio::test]
    async fn dispatch_failure_becomes_an_error_event() {
        let engine = ScriptedEngine::new(vec![Script::Dispatch(EngineError::api(
            500,
            "upstream exploded",
        ))]);
        let (orch, _) = orchestrator(engine);

        let events = collect(orch.clone().run_query("q").await.unwrap()).await;

        assert!(matches!(events[0], StreamEvent::Session { .. }));
        match &events[1] {
            StreamEvent::Error { error, .. } => assert!(error.contains("upstream exploded")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_dispatch_failures_are_retried() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Script::Dispatch(EngineError::api(503, "overloaded")),
            Script::Stream(vec![
                Ok(EngineEvent::Text("ok".to_string())),
                Ok(EngineEvent::Done),
            ]),
        ]));
        let store = Arc::new(MemoryStore::default());
        let engine_dyn: Arc<dyn QueryEngine> = engine.clone();
        let store_dyn: Arc<dyn SessionStore> = store;
        let orch = Arc::new(SessionOrchestrator::new(
            AgentSession::new("session_retry"),
            engine_dyn,
            store_dyn,
            Arc::new(ResultCache::new(100, Duration::from_secs(300))),
            Arc::new(ResultCache::new(100, Duration::from_secs(300))),
            RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            SessionLimits::default(),
        ));

        let events = collect(orch.clone().run_query("q").await.unwrap()).await;

        assert_eq!(engine.invocation_count(), 2);
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn sequential_queries_grow_one_transcript() {
        let engine = ScriptedEngine::new(vec![
            Script::Stream(vec![
                Ok(EngineEvent::Text("first".to_string())),
                Ok(EngineEvent::Done),
            ]),
            Script::Stream(vec![
                Ok(EngineEvent::Text("second".to_string())),
                Ok(EngineEvent::Done),
            ]),
        ]);
        let (orch, _) = orchestrator(engine);

        collect(orch.clone().run_query("q1").await.unwrap()).await;
        let events = collect(orch.clone().run_query("q2").await.unwrap()).await;

        match events.last() {
            Some(StreamEvent::Complete { session_stats }) => {
                assert_eq!(session_stats.message_count, 4);
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_queries_serialize_and_respect_quota() {
        let engine = ScriptedEngine::new(vec![
            Script::Stream(vec![
                Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
                Ok(EngineEvent::Done),
            ]),
            Script::Stream(vec![
                Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
                Ok(EngineEvent::Done),
            ]),
        ]);
        let engine = Arc::new(engine);
        let orch = build(
            Arc::clone(&engine),
            Arc::new(MemoryStore::default()),
            AgentSession::new("session_race"),
            SessionLimits {
                max_searches: 1,
                ..SessionLimits::default()
            },
        );

        let a = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move {
                match orch.run_query("race a").await {
                    Ok(stream) => Ok(collect(stream).await),
                    Err(e) => Err(e),
                }
            }
        });
        let b = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move {
                match orch.run_query("race b").await {
                    Ok(stream) => Ok(collect(stream).await),
                    Err(e) => Err(e),
                }
            }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let completed = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(QueryError::QuotaExceeded { .. })))
            .count();

        assert_eq!(completed, 1);
        assert_eq!(rejected, 1);
        assert_eq!(orch.stats().web_searches_used, 1);
    }

    #[tokio::test]
    async fn snapshot_is_persisted_on_completion() {
        let engine = Arc::new(ScriptedEngine::streaming(vec![
            Ok(EngineEvent::Text("answer".to_string())),
            Ok(EngineEvent::ToolUse(ToolKind::WebFetch)),
            Ok(EngineEvent::Done),
        ]));
        let store = Arc::new(MemoryStore::default());
        let orch = build(
            Arc::clone(&engine),
            Arc::clone(&store),
            AgentSession::new("session_persist"),
            SessionLimits::default(),
        );

        collect(orch.clone().run_query("q").await.unwrap()).await;

        let snapshot = store.snapshot("session_persist").unwrap();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, "answer");
        assert_eq!(snapshot.web_fetches_used, 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_query_lock() {
        let engine = ScriptedEngine::new(vec![
            Script::Stream(vec![
                Ok(EngineEvent::Text("abandoned".to_string())),
                Ok(EngineEvent::Done),
            ]),
            Script::Stream(vec![
                Ok(EngineEvent::Text("served".to_string())),
                Ok(EngineEvent::Done),
            ]),
        ]);
        let (orch, _) = orchestrator(engine);

        let stream = orch.clone().run_query("q1").await.unwrap();
        drop(stream);

        // Must not deadlock waiting on the abandoned query's lock.
        let events = tokio::time::timeout(
            Duration::from_secs(5),
            orch.clone().run_query("q2"),
        )
        .await
        .expect("second query timed out")
        .unwrap();
        let events = collect(events).await;
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn empty_answer_still_appends_an_assistant_message() {
        let (orch, _) = orchestrator(ScriptedEngine::streaming(vec![Ok(EngineEvent::Done)]));

        let events = collect(orch.clone().run_query("q").await.unwrap()).await;

        match events.last() {
            Some(StreamEvent::Complete { session_stats }) => {
                assert_eq!(session_stats.message_count, 2);
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn search_caches_results_and_counts_quota_once() {
        let engine = Arc::new(ScriptedEngine::streaming(vec![
            Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
            Ok(EngineEvent::Text("rust is a language".to_string())),
            Ok(EngineEvent::Done),
        ]));
        let orch = build(
            Arc::clone(&engine),
            Arc::new(MemoryStore::default()),
            AgentSession::new("session_search"),
            SessionLimits::default(),
        );

        let first = orch.search("rust").await.unwrap();
        assert_eq!(first, "rust is a language");
        assert_eq!(engine.invocation_count(), 1);
        assert_eq!(orch.stats().web_searches_used, 1);

        // Second identical search hits the cache: no engine call, no quota.
        let second = orch.search("rust").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(engine.invocation_count(), 1);
        assert_eq!(orch.stats().web_searches_used, 1);
    }

    #[tokio::test]
    async fn search_respects_the_quota() {
        let engine = Arc::new(ScriptedEngine::streaming(vec![Ok(EngineEvent::Done)]));
        let orch = build(
            Arc::clone(&engine),
            Arc::new(MemoryStore::default()),
            AgentSession::new("session_no_budget"),
            SessionLimits {
                max_searches: 0,
                ..SessionLimits::default()
            },
        );

        let err = orch.search("anything").await.unwrap_err();
        assert!(matches!(err, QueryError::QuotaExceeded { used: 0, max: 0 }));
        assert_eq!(engine.invocation_count(), 0);
    }

    #[tokio::test]
    async fn fetch_counts_fetches_and_caches() {
        let engine = Arc::new(ScriptedEngine::streaming(vec![
            Ok(EngineEvent::Text("page body".to_string())),
            Ok(EngineEvent::Done),
        ]));
        let orch = build(
            Arc::clone(&engine),
            Arc::new(MemoryStore::default()),
            AgentSession::new("session_fetch"),
            SessionLimits::default(),
        );

        let body = orch.fetch("https://example.com").await.unwrap();
        assert_eq!(body, "page body");
        assert_eq!(orch.stats().web_fetches_used, 1);

        let again = orch.fetch("https://example.com").await.unwrap();
        assert_eq!(again, body);
        assert_eq!(engine.invocation_count(), 1);
        assert_eq!(orch.stats().web_fetches_used, 1);
    }

    #[test]
    fn validation_accepts_reasonable_queries() {
        assert!(validate_query("what is rust?".to_string()).is_ok());
        assert!(validate_query("x".repeat(MAX_QUERY_CHARS)).is_ok());
    }
}
