//! Integration tests for session persistence and restart recovery.
//!
//! Sessions snapshot to `<sessions>/<id>.json` after every state change.
//! These tests drive the HTTP API over a shared directory and rebuild the
//! service on top of it to simulate process restarts.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use querent::engine::{EngineEvent, QueryEngine, ToolKind};
use querent::server;
use querent::session::SessionLimits;

mod common;
use common::{ScriptedEngine, test_state_in};

// ============================================================================
// Helpers
// ============================================================================

fn service_over(sessions_dir: &Path, engine: Arc<dyn QueryEngine>) -> Router {
    service_with_limits(sessions_dir, engine, SessionLimits::default())
}

fn service_with_limits(
    sessions_dir: &Path,
    engine: Arc<dyn QueryEngine>,
    limits: SessionLimits,
) -> Router {
    server::build_app(test_state_in(sessions_dir, engine, limits), 300)
}

fn searching_engine() -> Arc<ScriptedEngine> {
    Arc::new(ScriptedEngine::new(vec![vec![
        Ok(EngineEvent::ToolUse(ToolKind::WebSearch)),
        Ok(EngineEvent::Text("answer".to_string())),
        Ok(EngineEvent::Done),
    ]]))
}

/// Collect the JSON payload of every SSE data frame.
fn parse_sse_data(body: &str) -> Vec<serde_json::Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("frame payload is JSON"))
        .collect()
}

/// POST a query and return the parsed SSE frames.
async fn post_query(app: &Router, body: serde_json::Value) -> Vec<serde_json::Value> {
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/v1/query")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    parse_sse_data(&String::from_utf8(bytes.to_vec()).unwrap())
}

// ============================================================================
// Snapshot Contents
// ============================================================================

#[tokio::test]
async fn snapshot_written_after_query() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");
    let app = service_over(&sessions_dir, searching_engine());

    let frames = post_query(&app, serde_json::json!({"query": "what is rust?"})).await;
    let session_id = frames[0]["session_id"].as_str().unwrap().to_string();

    let snapshot_path = sessions_dir.join(format!("{session_id}.json"));
    assert!(snapshot_path.exists());

    // No temp file left behind by the atomic write
    assert!(!sessions_dir.join(format!("{session_id}.json.tmp")).exists());

    let raw = tokio::fs::read(&snapshot_path).await.unwrap();
    let snapshot: serde_json::Value = serde_json::from_slice(&raw).unwrap();

    assert_eq!(snapshot["session_id"], session_id.as_str());
    assert_eq!(snapshot["web_searches_used"], 1);
    assert_eq!(snapshot["web_fetches_used"], 0);
    assert!(snapshot.get("started_at").is_some());

    let messages = snapshot["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "what is rust?");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "answer");
}

// ============================================================================
// Restart Recovery
// ============================================================================

#[tokio::test]
async fn restart_resumes_session_with_counters() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");

    // First process: one query that burns a search
    let app = service_over(&sessions_dir, searching_engine());
    let frames = post_query(&app, serde_json::json!({"query": "first question"})).await;
    let session_id = frames[0]["session_id"].as_str().unwrap().to_string();
    drop(app);

    // Second process over the same directory
    let engine = Arc::new(ScriptedEngine::new(vec![vec![
        Ok(EngineEvent::Text("second answer".to_string())),
        Ok(EngineEvent::Done),
    ]]));
    let app = service_over(&sessions_dir, engine);

    let frames = post_query(
        &app,
        serde_json::json!({"query": "follow-up", "session_id": session_id}),
    )
    .await;

    assert_eq!(frames[0]["session_id"], session_id.as_str());

    let stats = &frames.last().unwrap()["session_stats"];
    assert_eq!(stats["web_searches_used"], 1); // carried across the restart
    assert_eq!(stats["message_count"], 4);
}

#[tokio::test]
async fn restart_lists_only_resumed_sessions() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");

    let app = service_over(&sessions_dir, searching_engine());
    let frames = post_query(&app, serde_json::json!({"query": "hello"})).await;
    let session_id = frames[0]["session_id"].as_str().unwrap().to_string();
    drop(app);

    let app = service_over(&sessions_dir, Arc::new(ScriptedEngine::new(vec![])));

    // Dormant snapshots are not live sessions
    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 0);

    // Resuming through a query brings the session back
    post_query(
        &app,
        serde_json::json!({"query": "wake up", "session_id": session_id}),
    )
    .await;

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert_eq!(json["sessions"][0]["session_id"], session_id.as_str());
}

#[tokio::test]
async fn quota_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");
    let limits = SessionLimits {
        max_searches: 1,
        ..SessionLimits::default()
    };

    let app = service_with_limits(&sessions_dir, searching_engine(), limits.clone());
    let frames = post_query(&app, serde_json::json!({"query": "spend the quota"})).await;
    let session_id = frames[0]["session_id"].as_str().unwrap().to_string();
    assert_eq!(
        frames.last().unwrap()["session_stats"]["web_searches_used"],
        1
    );
    drop(app);

    let app = service_with_limits(
        &sessions_dir,
        Arc::new(ScriptedEngine::new(vec![])),
        limits,
    );

    let response = app
        .oneshot(
            Request::post("/api/v1/query")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"query": "one more", "session_id": session_id}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["detail"].as_str().unwrap().contains("1 of 1"));
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn delete_removes_live_session_and_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");
    let app = service_over(&sessions_dir, searching_engine());

    let frames = post_query(&app, serde_json::json!({"query": "ephemeral"})).await;
    let session_id = frames[0]["session_id"].as_str().unwrap().to_string();
    let snapshot_path = sessions_dir.join(format!("{session_id}.json"));
    assert!(snapshot_path.exists());

    let response = app
        .clone()
        .oneshot(
            Request::delete(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!snapshot_path.exists());

    // Second delete finds nothing
    let response = app
        .clone()
        .oneshot(
            Request::delete(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_reaches_dormant_snapshots() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");

    let app = service_over(&sessions_dir, searching_engine());
    let frames = post_query(&app, serde_json::json!({"query": "hello"})).await;
    let session_id = frames[0]["session_id"].as_str().unwrap().to_string();
    drop(app);

    // After a restart the session is dormant, but deletion still works
    let app = service_over(&sessions_dir, Arc::new(ScriptedEngine::new(vec![])));
    let response = app
        .oneshot(
            Request::delete(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!sessions_dir.join(format!("{session_id}.json")).exists());
}

// ============================================================================
// Corrupt Snapshots
// ============================================================================

#[tokio::test]
async fn corrupt_snapshot_falls_back_to_fresh_session() {
    let temp_dir = TempDir::new().unwrap();
    let sessions_dir = temp_dir.path().join("sessions");
    tokio::fs::create_dir_all(&sessions_dir).await.unwrap();
    tokio::fs::write(sessions_dir.join("session_corrupt.json"), b"{not json")
        .await
        .unwrap();

    let app = service_over(&sessions_dir, Arc::new(ScriptedEngine::new(vec![])));

    let frames = post_query(
        &app,
        serde_json::json!({"query": "hello", "session_id": "session_corrupt"}),
    )
    .await;

    // The broken snapshot is never adopted; the query runs on a fresh session
    let session_id = frames[0]["session_id"].as_str().unwrap();
    assert_ne!(session_id, "session_corrupt");
    assert_eq!(frames.last().unwrap()["type"], "complete");
}
