//! Bounded TTL cache for engine results.
//!
//! Web searches and page fetches are expensive, so their results are kept
//! in a bounded cache keyed by a fingerprint of the request parameters.
//! Entries expire on a TTL; when the cache is full, the oldest entry by
//! creation time is evicted (creation order, not least-recently-used).
//! An optional byte sink mirrors the cache state after every write so it
//! survives restarts.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// Entries and Stats
// ============================================================================

/// A cached value with its bookkeeping, serialized as-is into the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time counters reported by [`ResultCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
}

// ============================================================================
// Durability Sink
// ============================================================================

/// Durable mirror for cache state.
///
/// The cache writes its full serialized state after every insert and
/// reloads it at construction. Sink failures are logged, never fatal.
pub trait CacheSink: Send + Sync {
    /// Read the last saved state, `None` when nothing was ever saved.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;
    /// Replace the saved state.
    fn save(&self, bytes: &[u8]) -> io::Result<()>;
    /// Drop the saved state.
    fn clear(&self) -> io::Result<()>;
}

/// File-backed sink. Saves go through a temp file + rename so a crash
/// mid-write never leaves a truncated document behind.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CacheSink for FileSink {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Why a sink's saved state could not be used.
///
/// Recoverable by definition: the cache starts empty and carries on.
#[derive(Debug, Error)]
pub enum SinkLoadError {
    #[error("failed to read cache sink: {0}")]
    Read(#[source] io::Error),
    #[error("cache sink contents are corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
}

/// Document mirrored through the sink.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    entries: Vec<CacheEntry>,
    hits: u64,
    misses: u64,
}

// ============================================================================
// ResultCache
// ============================================================================

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Bounded TTL cache with creation-order eviction and hit/miss accounting.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    default_ttl: Duration,
    sink: Option<Box<dyn CacheSink>>,
}

impl ResultCache {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// In-memory cache holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_size,
            default_ttl,
            sink: None,
        }
    }

    /// Cache mirrored through `sink`, preloaded from its last saved state.
    ///
    /// Entries already expired at load time are dropped. An unreadable or
    /// corrupt sink is logged and treated as empty; construction never
    /// fails.
    #[must_use]
    pub fn with_sink(max_size: usize, default_ttl: Duration, sink: Box<dyn CacheSink>) -> Self {
        let inner = match Self::load_from_sink(sink.as_ref()) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(error = %e, "Cache sink unreadable, starting empty");
                CacheInner::default()
            }
        };
        Self {
            inner: Mutex::new(inner),
            max_size,
            default_ttl,
            sink: Some(sink),
        }
    }

    fn load_from_sink(sink: &dyn CacheSink) -> Result<CacheInner, SinkLoadError> {
        let Some(bytes) = sink.load().map_err(SinkLoadError::Read)? else {
            return Ok(CacheInner::default());
        };
        let state: PersistedState =
            serde_json::from_slice(&bytes).map_err(SinkLoadError::Corrupt)?;

        let now = Utc::now();
        let mut entries = HashMap::with_capacity(state.entries.len());
        let mut dropped = 0usize;
        for entry in state.entries {
            if entry.is_expired_at(now) {
                dropped += 1;
            } else {
                entries.insert(entry.key.clone(), entry);
            }
        }
        if dropped > 0 {
            debug!(dropped, "Dropped expired cache entries at load");
        }

        Ok(CacheInner {
            entries,
            hits: state.hits,
            misses: state.misses,
        })
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Look up a key. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Utc::now();

        let expired = matches!(inner.entries.get(key), Some(e) if e.is_expired_at(now));
        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            debug!(key, "Cache miss (expired)");
            return None;
        }

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.hit_count += 1;
            let hit_count = entry.hit_count;
            let value = entry.value.clone();
            inner.hits += 1;
            debug!(key, hit_count, "Cache hit");
            Some(value)
        } else {
            inner.misses += 1;
            debug!(key, "Cache miss");
            None
        }
    }

    /// Insert with the cache's default TTL.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL.
    ///
    /// A new key at capacity first evicts the entry with the smallest
    /// `created_at`. Overwriting an existing key is not an insertion and
    /// never evicts.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let key = key.into();
        let value = value.into();
        let now = Utc::now();

        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            let oldest = inner
                .entries
                .values()
                .min_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.key.cmp(&b.key))
                })
                .map(|e| e.key.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                debug!(evicted = %oldest, "Cache full, evicted oldest entry");
            }
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at: now,
                expires_at,
                hit_count: 0,
            },
        );

        self.persist(&inner);
    }

    /// Drop all entries and reset the hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.clear() {
                warn!(error = %e, "Failed to clear cache sink");
            }
        }
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Utc::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired_at(now));
        let removed = before - inner.entries.len();

        if removed > 0 {
            debug!(removed, "Removed expired cache entries");
            self.persist(&inner);
        }
        removed
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
            total_requests: total,
        }
    }

    /// Number of live entries (expired ones included until swept).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &CacheInner) {
        let Some(sink) = &self.sink else {
            return;
        };

        let state = PersistedState {
            entries: inner.entries.values().cloned().collect(),
            hits: inner.hits,
            misses: inner.misses,
        };
        match serde_json::to_vec(&state) {
            Ok(bytes) => {
                if let Err(e) = sink.save(&bytes) {
                    warn!(error = %e, "Failed to persist cache state");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize cache state"),
        }
    }
}

// ============================================================================
// Key Fingerprints
// ============================================================================

/// Deterministic cache key for a request.
///
/// The parameters are serialized with object keys sorted at every level,
/// hashed with SHA-256, truncated to 16 hex characters, and prefixed with
/// the operation tag, e.g. `search:a1b2c3d4e5f60718`. Parameter sets
/// differing only in field order produce the same key.
#[must_use]
pub fn fingerprint(tag: &str, params: &serde_json::Value) -> String {
    let canonical = canonicalize(params).to_string();
    let hash = Sha256::digest(canonical.as_bytes());
    let hex = format!("{hash:x}");
    format!("{tag}:{}", &hex[..16])
}

/// Rebuild a JSON value with object keys sorted at every level.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
