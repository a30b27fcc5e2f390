//! State persistence: file and shared-cache backends.
//!
//! A limiter owns its in-memory state; this module only carries snapshots to
//! and from an external medium. Every failure here is logged at warning
//! level and swallowed, leaving the in-memory state authoritative.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::LimiterConfig;
use crate::error::CacheError;

/// Shared key-value cache a limiter can persist through.
///
/// Implementations are supplied by the caller (Redis, memcached, an
/// in-process map). The limiter reads once at construction and writes on
/// flush; it treats the cache as a best-effort coordination point, not a
/// lock service.
pub trait SharedCache: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the backend is unreachable or misbehaves;
    /// the limiter logs and continues.
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key` with a time-to-live.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the backend is unreachable or misbehaves;
    /// the limiter logs and continues.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

/// Serialized form of a limiter's full state.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    /// Key to per-key state object.
    pub state: Map<String, Value>,
    /// Key to header-derived effective rate.
    pub dynamic_limits: HashMap<String, f64>,
    /// Wall-clock seconds at flush time.
    pub timestamp: f64,
}

impl Snapshot {
    /// Encode with the given top-level name for the state map (`buckets` or
    /// `windows`, kept for readers of the older layout).
    fn to_json(&self, state_key: &str) -> Value {
        let mut root = Map::new();
        root.insert(state_key.to_string(), Value::Object(self.state.clone()));
        root.insert(
            "dynamic_limits".to_string(),
            serde_json::to_value(&self.dynamic_limits).unwrap_or_else(|_| Value::Object(Map::new())),
        );
        root.insert("timestamp".to_string(), Value::from(self.timestamp));
        Value::Object(root)
    }

    /// Decode, accepting `state` as well as the legacy `buckets` / `windows`
    /// top-level names.
    fn from_json(root: &Value) -> Option<Self> {
        let root = root.as_object()?;
        let state = ["state", "buckets", "windows"]
            .iter()
            .find_map(|name| root.get(*name))?
            .as_object()?
            .clone();
        let dynamic_limits = root
            .get("dynamic_limits")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let timestamp = root.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        Some(Self {
            state,
            dynamic_limits,
            timestamp,
        })
    }
}

/// Persistence backend handle, chosen at limiter construction.
pub(crate) enum StateStore {
    File {
        path: PathBuf,
        state_key: &'static str,
    },
    Cache {
        cache: Arc<dyn SharedCache>,
        key: String,
        ttl: Duration,
        state_key: &'static str,
    },
}

impl StateStore {
    /// Select a backend for this configuration, or `None` when persistence
    /// is off or the state path falls outside the allowed roots.
    pub(crate) fn open(
        cfg: &LimiterConfig,
        cache: Option<Arc<dyn SharedCache>>,
        state_key: &'static str,
    ) -> Option<Self> {
        if !cfg.persist_state {
            return None;
        }

        if let Some(cache) = cache {
            return Some(Self::Cache {
                cache,
                key: cache_key(cfg),
                ttl: Duration::from_secs(cfg.cleanup_interval_secs.saturating_mul(2)),
                state_key,
            });
        }

        let path = cfg.state_file.as_deref()?;
        let path = sanitize_state_path(path)?;
        Some(Self::File { path, state_key })
    }

    /// Read and decode the stored snapshot. Missing or malformed data yields
    /// `None` with a warning; the limiter starts empty.
    pub(crate) fn load(&self) -> Option<Snapshot> {
        let raw = match self {
            Self::File { path, .. } => match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read state file");
                    return None;
                }
            },
            Self::Cache { cache, key, .. } => match cache.get(key) {
                Ok(Some(raw)) => raw,
                Ok(None) => return None,
                Err(err) => {
                    warn!(cache_key = %key, error = %err, "failed to read state from cache");
                    return None;
                }
            },
        };

        let root: Value = match serde_json::from_str(&raw) {
            Ok(root) => root,
            Err(err) => {
                warn!(error = %err, "discarding malformed persisted state");
                return None;
            }
        };

        let snapshot = Snapshot::from_json(&root);
        if snapshot.is_none() {
            warn!("discarding persisted state with unrecognized layout");
        }
        snapshot
    }

    /// Write a snapshot. Compact encoding; file writes go through a
    /// temporary file and an atomic rename so readers never see a partial
    /// payload.
    pub(crate) fn save(&self, snapshot: &Snapshot) {
        let (encoded, state_key) = match self {
            Self::File { state_key, .. } | Self::Cache { state_key, .. } => {
                (snapshot.to_json(state_key).to_string(), *state_key)
            }
        };
        debug!(state_key, keys = snapshot.state.len(), "flushing limiter state");

        match self {
            Self::File { path, .. } => {
                if let Err(err) = write_atomically(path, &encoded) {
                    warn!(path = %path.display(), error = %err, "failed to write state file");
                }
            }
            Self::Cache {
                cache, key, ttl, ..
            } => {
                if let Err(err) = cache.set(key, &encoded, *ttl) {
                    warn!(cache_key = %key, error = %err, "failed to write state to cache");
                }
            }
        }
    }
}

fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    let tmp = path.with_file_name(format!("{file_name}.{}.tmp", std::process::id()));

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// Derive the cache key for a configuration:
/// `four_rl_<algo prefix>_<8 hex chars>`.
///
/// The hashed identity material is the state-file path when one is set,
/// otherwise the rate/burst/window tuple, so limiters with the same shape
/// share a key.
pub(crate) fn cache_key(cfg: &LimiterConfig) -> String {
    let identity = cfg.state_file.as_ref().map_or_else(
        || {
            format!(
                "{}:{}:{}",
                cfg.rate_per_second, cfg.burst_capacity, cfg.window_size_ms
            )
        },
        |path| path.display().to_string(),
    );

    let digest = Sha256::digest(identity.as_bytes());
    let mut short = String::with_capacity(8);
    for byte in &digest[..4] {
        short.push_str(&format!("{byte:02x}"));
    }
    format!("four_rl_{}_{short}", cfg.algorithm.prefix())
}

/// Resolve and vet a state-file path.
///
/// Relative paths resolve against the current working directory. The result
/// is normalized lexically (no `.` / `..` segments) and must live under the
/// working directory or the system temporary directory; anything else is
/// rejected with a warning and the limiter runs in memory only. Existing
/// paths are additionally resolved through symlinks before the check.
pub(crate) fn sanitize_state_path(path: &Path) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let normalized = normalize(&absolute);

    let roots = [normalize(&cwd), normalize(&std::env::temp_dir())];
    let resolved = std::fs::canonicalize(&normalized).unwrap_or_else(|_| normalized.clone());
    let allowed = roots.iter().any(|root| {
        let root_resolved = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
        resolved.starts_with(&root_resolved) || normalized.starts_with(root)
    });

    if allowed {
        Some(normalized)
    } else {
        warn!(path = %path.display(), "state file path outside allowed roots, persistence disabled");
        None
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
