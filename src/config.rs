use serde::{Deserialize, Serialize};

/// Bytes per block; the unit of marker granularity and alignment for cache
/// writes.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Blocks per chunk. Chunks are the unit of remote fetch and prefetch.
pub const DEFAULT_CHUNK_BLOCKS: u64 = 1024;

pub const DEFAULT_CHUNK_SIZE: u64 = DEFAULT_BLOCK_SIZE * DEFAULT_CHUNK_BLOCKS;

/// Tunables for the block-device stack.
///
/// Mirrors the handful of parameters actually tunable at runtime
/// (`N_fetch`, `N_prefetch`, retry count/delay, block/chunk size) rather
/// than growing into a general settings object; everything else is wired
/// up by the caller composing the layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub block_size: u64,
    pub chunk_size: u64,
    pub fetch_concurrency: usize,
    pub prefetch_concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub bucket_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fetch_concurrency: 8,
            prefetch_concurrency: 2,
            max_retries: 3,
            retry_delay_ms: 10,
            bucket_name: Config::bucket_name_from_env().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Read the `BUCKET_NAME` environment variable.
    ///
    /// Kept separate from `Default` so tests can construct a `Config`
    /// without depending on process environment.
    pub fn bucket_name_from_env() -> Option<String> {
        std::env::var("BUCKET_NAME").ok()
    }

    /// Parse a `Config` from a JSON document, e.g. a sandbox orchestrator's
    /// on-disk settings file.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
