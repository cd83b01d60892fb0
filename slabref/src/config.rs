//! Runtime tuning.
//!
//! Backoff thresholds, page caching and collector behaviour are configuration
//! rather than constants. A process installs one [`Config`] (usually parsed
//! from TOML) before first use; everything falls back to defaults otherwise.

use crate::error::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Process-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Spin/yield/sleep backoff used by every latch.
    pub latch: LatchConfig,
    /// Defaults for allocators built with [`Allocator::new`](crate::Allocator::new).
    pub allocator: AllocatorConfig,
    /// Reclamation behaviour of the reference collector.
    pub collector: CollectorConfig,
}

/// Latch contention backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatchConfig {
    /// Failed attempts between yield/sleep pauses.
    pub spin_limit: u32,
    /// Sleep length per failed attempt, in nanoseconds.
    pub sleep_step_nanos: u64,
    /// Upper bound on a single sleep, in nanoseconds.
    pub max_sleep_nanos: u64,
    /// Fixed sleep between `RecursiveLatch` attempts, in nanoseconds.
    pub recursive_sleep_nanos: u64,
}

impl Default for LatchConfig {
    fn default() -> Self {
        Self {
            spin_limit: 16,
            sleep_step_nanos: 1_000,
            max_sleep_nanos: 1_000_000,
            recursive_sleep_nanos: 10_000,
        }
    }
}

/// Allocator sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Pages scanned by `get()`, and idle pages kept before release.
    pub page_cache: usize,
    /// Minimum reserved item count (when any are reserved).
    pub min_reserved: usize,
    /// Minimum items per extension page.
    pub min_extended: usize,
    /// Carve extension pages from the shared page pool. When `false` every
    /// page comes straight from the global allocator. Read once, on first use.
    pub page_pool: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            page_cache: 4,
            min_reserved: 32,
            min_extended: 32,
            page_pool: true,
        }
    }
}

/// Reference collector policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Run a background collector thread.
    pub background: bool,
    /// Pending objects beyond which a releasing thread collects inline.
    pub backlog_limit: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            background: true,
            backlog_limit: 65_536,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing tables and keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Install the process-wide configuration.
///
/// Returns `false` if a configuration was already installed (or already read
/// with defaults); the existing one stays in effect.
pub fn install(config: Config) -> bool {
    CONFIG.set(config).is_ok()
}

/// The active configuration.
#[inline]
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}
