use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub buffer: BufferConfig,
    pub engine: EngineConfig,
    pub reconciler: ReconcilerConfig,
    pub postgres: PostgresConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            buffer: BufferConfig::from_env(),
            engine: EngineConfig::from_env(),
            reconciler: ReconcilerConfig::from_env(),
            postgres: PostgresConfig::from_env(),
        }
    }

    /// Small, fast defaults for unit and integration tests.
    pub fn for_tests() -> Self {
        Self {
            buffer: BufferConfig {
                lateness_tolerance: Duration::from_secs(300),
                max_points_per_buffer: 256,
                shard_count: 4,
            },
            engine: EngineConfig {
                polling_interval: Duration::from_millis(50),
                worker_pool_size: 4,
                max_resident_actors: 64,
                eviction_grace: Duration::from_millis(100),
                dispatch_timeout: Duration::from_millis(200),
                max_attempts: 3,
                store_failure_threshold: 3,
                max_occurrences: 32,
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_millis(200),
                max_revision_lag: 100,
                rules_dir: PathBuf::from("data/rules"),
            },
            postgres: PostgresConfig { url: None },
        }
    }
}

// ── Time-series buffer ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Samples older than watermark - tolerance are dropped at ingest.
    pub lateness_tolerance: Duration,
    /// Hard cap on retained samples per point.
    pub max_points_per_buffer: usize,
    /// Number of lock shards partitioning the point map.
    pub shard_count: usize,
}

impl BufferConfig {
    pub fn from_env() -> Self {
        Self {
            lateness_tolerance: Duration::from_secs(env_u64("BUFFER_LATENESS_TOLERANCE_SECS", 900)),
            max_points_per_buffer: env_usize("BUFFER_MAX_POINTS", 2500),
            shard_count: env_usize("BUFFER_SHARDS", 16),
        }
    }
}

// ── Engine (actors + orchestrator) ────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between realtime ticks.
    pub polling_interval: Duration,
    /// Parallel actor steps allowed at once.
    pub worker_pool_size: usize,
    /// Resident actor cap before LRU eviction of idle actors.
    pub max_resident_actors: usize,
    /// How long a retiring actor lingers before removal.
    pub eviction_grace: Duration,
    /// How long a dispatch waits for pool capacity before the request
    /// is re-queued.
    pub dispatch_timeout: Duration,
    /// Execution request retry limit before it is marked Failed.
    pub max_attempts: u32,
    /// Consecutive store failures before the manager reports unhealthy.
    pub store_failure_threshold: u32,
    /// Max occurrence intervals retained per insight.
    pub max_occurrences: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            polling_interval: Duration::from_secs(env_u64("ENGINE_POLLING_INTERVAL_SECS", 60)),
            worker_pool_size: env_usize("ENGINE_WORKER_POOL", 8),
            max_resident_actors: env_usize("ENGINE_MAX_RESIDENT_ACTORS", 10_000),
            eviction_grace: Duration::from_secs(env_u64("ENGINE_EVICTION_GRACE_SECS", 30)),
            dispatch_timeout: Duration::from_secs(env_u64("ENGINE_DISPATCH_TIMEOUT_SECS", 30)),
            max_attempts: env_u32("ENGINE_MAX_ATTEMPTS", 5),
            store_failure_threshold: env_u32("ENGINE_STORE_FAILURE_THRESHOLD", 5),
            max_occurrences: env_usize("ENGINE_MAX_OCCURRENCES", 100),
        }
    }
}

// ── Git-sync reconciler ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation passes.
    pub interval: Duration,
    /// Max unseen revisions before the whole pass is refused as diverged.
    pub max_revision_lag: u64,
    /// Directory holding rule template YAML files.
    pub rules_dir: PathBuf,
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(env_u64("RECONCILE_INTERVAL_SECS", 300)),
            max_revision_lag: env_u64("RECONCILE_MAX_REVISION_LAG", 50),
            rules_dir: PathBuf::from(env_or("RULES_DIR", "data/rules")),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection URL; when unset the in-memory store is used.
    pub url: Option<String>,
}

impl PostgresConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_opt("DATABASE_URL"),
        }
    }
}
