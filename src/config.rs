//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - quiver.toml (default configuration)
//! - quiver.local.toml (git-ignored local overrides)
//! - Environment variables (QUIVER_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # quiver.toml
//! [engine]
//! contest_sample = 5
//! isa_huge = 1500000
//!
//! [resources]
//! cache_bytes = 8388608
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! QUIVER_ENGINE__ISA_HUGE=2097152
//! QUIVER_RESOURCES__CACHE_BYTES=16777216
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineTuning,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Iterator-engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Budget below which an operation may suspend without progress
    #[serde(default = "default_budget_min")]
    pub budget_min: i64,

    /// Ids collected per request tick before yielding
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Verified samples per AND-contest competitor
    #[serde(default = "default_contest_sample")]
    pub contest_sample: u64,

    /// Largest fully-enumerated intersection an AND trades for a fixed
    #[serde(default = "default_and_substitute_max")]
    pub and_substitute_max: u64,

    /// Source samples in the ISA statistics experiment
    #[serde(default = "default_isa_sample")]
    pub isa_sample: u64,

    /// ISA materialisation: largest source item count
    #[serde(default = "default_isa_materialize_max_items")]
    pub isa_materialize_max_items: u64,

    /// ISA materialisation: largest per-item source next cost
    #[serde(default = "default_isa_materialize_next_cost")]
    pub isa_materialize_next_cost: i64,

    /// ISA materialisation: largest projected total cost
    #[serde(default = "default_isa_materialize_total_cost")]
    pub isa_materialize_total_cost: i64,

    /// Expected-output threshold separating STORABLE from INTERSECT dedup
    #[serde(default = "default_isa_huge")]
    pub isa_huge: u64,

    /// Largest STATE piece a cursor may carry, in bytes
    #[serde(default = "default_cursor_state_cap")]
    pub cursor_state_cap: usize,

    /// Soft request deadline in milliseconds (0 = none): freeze and return
    #[serde(default)]
    pub soft_timeout_ms: u64,

    /// Hard request deadline in milliseconds (0 = none): abort as too hard
    #[serde(default)]
    pub hard_timeout_ms: u64,
}

/// Resource-cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Byte cap on retained storables (LRU beyond this)
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_budget_min() -> i64 {
    10
}
fn default_page_size() -> usize {
    64
}
fn default_contest_sample() -> u64 {
    5
}
fn default_and_substitute_max() -> u64 {
    5
}
fn default_isa_sample() -> u64 {
    5
}
fn default_isa_materialize_max_items() -> u64 {
    300
}
fn default_isa_materialize_next_cost() -> i64 {
    50
}
fn default_isa_materialize_total_cost() -> i64 {
    15_000
}
fn default_isa_huge() -> u64 {
    1_500_000
}
fn default_cursor_state_cap() -> usize {
    1024
}
fn default_cache_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl EngineConfig {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. quiver.toml (base configuration)
    /// 2. quiver.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (QUIVER_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("quiver.toml"))
            .merge(Toml::file("quiver.local.toml"))
            .merge(Env::prefixed("QUIVER_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("QUIVER_").split("__"))
            .extract()
    }
}

impl Default for EngineTuning {
    fn default() -> Self {
        EngineTuning {
            budget_min: default_budget_min(),
            page_size: default_page_size(),
            contest_sample: default_contest_sample(),
            and_substitute_max: default_and_substitute_max(),
            isa_sample: default_isa_sample(),
            isa_materialize_max_items: default_isa_materialize_max_items(),
            isa_materialize_next_cost: default_isa_materialize_next_cost(),
            isa_materialize_total_cost: default_isa_materialize_total_cost(),
            isa_huge: default_isa_huge(),
            cursor_state_cap: default_cursor_state_cap(),
            soft_timeout_ms: 0,
            hard_timeout_ms: 0,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            cache_bytes: default_cache_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
