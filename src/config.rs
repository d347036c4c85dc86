use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryPolicy;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Workspace directory, resolved against the config file location.
    pub fn workspace_dir(&self, config_path: &Path) -> PathBuf {
        let dir = self
            .workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));
        resolve_path(config_path, &dir)
    }
}

/// Resolve a path relative to the config file directory.
///
/// If the path is absolute, it is returned as-is.
/// If the path is relative, it is joined with the config file's parent directory.
///
/// This ensures consistent behavior regardless of the current working directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default workspace directory (relative to config file).
pub const DEFAULT_WORKSPACE: &str = ".querent";
/// Default sessions directory (relative to workspace).
pub const DEFAULT_SESSIONS_DIR: &str = "sessions";

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_base_url() -> String {
    crate::engine::DEFAULT_BASE_URL.to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_max_searches() -> u32 {
    10
}

fn default_cache_max_size() -> usize {
    100
}

fn default_search_ttl() -> u64 {
    1800
}

fn default_fetch_ttl() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retention_days() -> u32 {
    7
}

/// Serde default for bool fields that should be `true` (serde's default is `false`).
fn default_true() -> bool {
    true
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports the following syntax (shell-compatible):
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `${VAR:-}` - Optional variable, empty string if not set
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// # Limitations
///
/// - No nested/recursive expansion: `${VAR:-${DEFAULT}}` is not supported
/// - Unclosed `${` (missing `}`) returns an error
///
/// # Examples
///
/// ```yaml
/// # Required - errors if ANTHROPIC_API_KEY is not set
/// engine:
///   api_key: ${ANTHROPIC_API_KEY}
///
/// # Optional with default
/// server:
///   host: ${HOST:-0.0.0.0}
///   port: ${PORT:-8080}
///
/// # Plain $ doesn't need escaping
/// # note: $100 stays as-is
/// ```
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            match chars.peek() {
                // Escaped $ -> literal $
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                // Start of variable reference
                Some('{') => {
                    chars.next(); // consume '{'
                    let expanded = parse_var_reference(&mut chars)?;
                    result.push_str(&expanded);
                }
                // Not a variable reference, keep literal $
                _ => {
                    result.push('$');
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// Parse a variable reference after seeing `${`.
///
/// Handles:
/// - `VAR}` - Required variable
/// - `VAR:-default}` - Variable with default
///
/// Returns error if closing `}` is missing.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut var_name = String::new();
    let mut default_value: Option<String> = None;
    let mut in_default = false;
    let mut found_closing_brace = false;

    while let Some(&c) = chars.peek() {
        match c {
            '}' => {
                chars.next(); // consume '}'
                found_closing_brace = true;
                break;
            }
            ':' if !in_default => {
                chars.next(); // consume ':'
                // Check for '-' (default value syntax)
                if chars.peek() == Some(&'-') {
                    chars.next(); // consume '-'
                    in_default = true;
                    default_value = Some(String::new());
                } else {
                    // ':' without '-' is part of var name (unusual but valid)
                    var_name.push(':');
                }
            }
            _ => {
                chars.next();
                if in_default {
                    default_value.as_mut().unwrap().push(c);
                } else {
                    var_name.push(c);
                }
            }
        }
    }

    if !found_closing_brace {
        return Err(ConfigError::UnclosedVarReference);
    }

    // Look up the environment variable
    match std::env::var(&var_name) {
        Ok(value) => Ok(value),
        Err(_) => match default_value {
            Some(default) => Ok(default),
            None => Err(ConfigError::MissingEnvVar(var_name)),
        },
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            keep_alive_interval_seconds: default_keep_alive_interval(),
        }
    }
}

// ============================================================================
// EngineConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// API key. Falls back to `$ANTHROPIC_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Longest silence tolerated between engine stream events.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub enable_web_search: bool,
    #[serde(default = "default_true")]
    pub enable_web_fetch: bool,
    /// Domains the fetch tool may touch. Empty means no restriction.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Domains the fetch tool must never touch.
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            idle_timeout_seconds: default_idle_timeout(),
            enable_web_search: true,
            enable_web_fetch: true,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Explicit key, falling back to `$ANTHROPIC_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

// ============================================================================
// QuotaConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QuotaConfig {
    /// Web searches allowed per session.
    #[serde(default = "default_max_searches")]
    pub max_searches: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_searches: default_max_searches(),
        }
    }
}

// ============================================================================
// CacheConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Entries per cache instance.
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_search_ttl")]
    pub search_ttl_seconds: u64,
    #[serde(default = "default_fetch_ttl")]
    pub fetch_ttl_seconds: u64,
    /// Persist cache contents to the workspace across restarts.
    #[serde(default)]
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            search_ttl_seconds: default_search_ttl(),
            fetch_ttl_seconds: default_fetch_ttl(),
            persist: false,
        }
    }
}

// ============================================================================
// RetryConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_seconds: default_initial_delay(),
            max_delay_seconds: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_secs_f64(self.initial_delay_seconds),
            max_delay: Duration::from_secs_f64(self.max_delay_seconds),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

// ============================================================================
// SessionsConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionsConfig {
    /// Days to keep session snapshots before the maintenance sweep removes
    /// them. Zero disables the sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
