//! HTTP server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use querent::cache::{FileSink, ResultCache};
use querent::config::{self, Config};
use querent::engine::{AnthropicEngine, QueryEngine, ToolKind};
use querent::server::{self, AppState, RuntimeServices};
use querent::session::{SessionLimits, SessionRegistry};
use querent::store::{FileSessionStore, SessionStore};

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path).await?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    // Resolve workspace root relative to the config file
    let config_path_ref = Path::new(config_path);
    let workspace = config.workspace_dir(config_path_ref);
    let sessions_path = workspace.join(config::DEFAULT_SESSIONS_DIR);

    let api_key = config
        .engine
        .resolve_api_key()
        .context("no API key configured (set engine.api_key or ANTHROPIC_API_KEY)")?;

    let engine: Arc<dyn QueryEngine> = Arc::new(
        AnthropicEngine::new(api_key, config.engine.model.clone())
            .with_base_url(config.engine.base_url.clone())
            .with_domain_filters(
                config.engine.allowed_domains.clone(),
                config.engine.blocked_domains.clone(),
            ),
    );
    info!(model = %config.engine.model, "Query engine initialized");

    // Result caches, optionally mirrored into the workspace
    let search_cache = Arc::new(build_cache(
        config.cache.max_size,
        config.cache.search_ttl_seconds,
        config
            .cache
            .persist
            .then(|| workspace.join("search_cache.json")),
    ));
    let fetch_cache = Arc::new(build_cache(
        config.cache.max_size,
        config.cache.fetch_ttl_seconds,
        config
            .cache
            .persist
            .then(|| workspace.join("fetch_cache.json")),
    ));

    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(&sessions_path));

    let limits = SessionLimits {
        max_searches: config.quota.max_searches,
        idle_timeout: Duration::from_secs(config.engine.idle_timeout_seconds),
        tools: enabled_tools(&config),
    };
    let registry = SessionRegistry::new(
        engine,
        Arc::clone(&store),
        Arc::clone(&search_cache),
        Arc::clone(&fetch_cache),
        config.retry.policy(),
        limits,
    );

    spawn_maintenance_sweep(
        Arc::clone(&store),
        Arc::clone(&search_cache),
        Arc::clone(&fetch_cache),
        config.sessions.retention_days,
    );

    let services = RuntimeServices {
        registry,
        search_cache,
        fetch_cache,
    };
    let state = AppState {
        services,
        keep_alive_interval_seconds: config.server.keep_alive_interval_seconds,
        max_concurrent_requests: config.server.max_concurrent_requests,
    };

    let app = server::build_app(state, config.server.request_timeout_seconds);

    let ip: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(addr = %addr, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Build a result cache, mirrored through a file sink when a path is given.
fn build_cache(max_size: usize, ttl_seconds: u64, persist_path: Option<PathBuf>) -> ResultCache {
    let ttl = Duration::from_secs(ttl_seconds);
    match persist_path {
        Some(path) => ResultCache::with_sink(max_size, ttl, Box::new(FileSink::new(path))),
        None => ResultCache::new(max_size, ttl),
    }
}

/// Tools the engine is allowed to use, per config toggles.
fn enabled_tools(config: &Config) -> Vec<ToolKind> {
    let mut tools = Vec::new();
    if config.engine.enable_web_search {
        tools.push(ToolKind::WebSearch);
    }
    if config.engine.enable_web_fetch {
        tools.push(ToolKind::WebFetch);
    }
    tools
}

/// Hourly sweep for expired cache entries and aged-out session snapshots.
///
/// A `retention_days` of zero keeps snapshots forever; the cache sweep still
/// runs.
fn spawn_maintenance_sweep(
    store: Arc<dyn SessionStore>,
    search_cache: Arc<ResultCache>,
    fetch_cache: Arc<ResultCache>,
    retention_days: u32,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.tick().await; // skip immediate tick
        loop {
            interval.tick().await;

            let evicted = search_cache.cleanup_expired() + fetch_cache.cleanup_expired();
            if evicted > 0 {
                info!(evicted, "Expired cache entries removed");
            }

            if retention_days > 0 {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
                match store.cleanup_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Aged-out session snapshots removed"),
                    Err(e) => warn!(error = %e, "Session snapshot sweep failed"),
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
