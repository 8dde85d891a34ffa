//! Runtime configuration
//!
//! Every section has serde defaults, so an empty TOML file (or no file at
//! all) yields a working configuration. The binary layers CLI/env overrides
//! on top of what is loaded here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncwrightError};
use crate::types::StorageConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncwrightConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Adapters registered at startup
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

impl SyncwrightConfig {
    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: SyncwrightConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the background loops misbehave
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_secs == 0 {
            return Err(SyncwrightError::Config(
                "scheduler.tick_interval_secs must be > 0".to_string(),
            ));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(SyncwrightError::Config(
                "queue.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.queue.workers == 0 {
            return Err(SyncwrightError::Config(
                "queue.workers must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dedup.fuzzy_threshold) {
            return Err(SyncwrightError::Config(
                "dedup.fuzzy_threshold must be within [0, 1]".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for adapter in &self.adapters {
            if adapter.id.trim().is_empty() {
                return Err(SyncwrightError::Config("adapter id must not be empty".to_string()));
            }
            if !seen.insert(adapter.id.as_str()) {
                return Err(SyncwrightError::Config(format!(
                    "adapter {} is declared twice",
                    adapter.id
                )));
            }
        }
        if self.engine.page_size == 0 {
            return Err(SyncwrightError::Config(
                "engine.page_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Kind of adapter binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// JSON files in a directory, one per entity type
    JsonDir,
    /// In-process store, empty at startup
    Memory,
}

/// One `[[adapters]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub id: String,
    pub kind: AdapterKind,
    /// Directory for `json_dir` adapters; `~` is expanded
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// Scheduler loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run the periodic scheduler at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: default_tick_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Work queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Milliseconds a worker sleeps when the queue is empty
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retries granted to jobs that do not specify their own
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Upper bound of the exponential backoff, in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Completed/failed jobs older than this are swept
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Seconds between retention sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            workers: default_workers(),
            default_max_retries: default_max_retries(),
            max_backoff_secs: default_max_backoff(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

/// Sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Page size requested from adapters
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Persist counters/progress every N processed entities
    #[serde(default = "default_progress_flush")]
    pub progress_flush_every: usize,
    /// How many recently updated local records take part in fuzzy matching
    #[serde(default = "default_fuzzy_window")]
    pub fuzzy_scan_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            progress_flush_every: default_progress_flush(),
            fuzzy_scan_window: default_fuzzy_window(),
        }
    }
}

/// Deduplication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Title similarity above which two records are considered duplicates
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: default_fuzzy_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_retention_days() -> i64 {
    7
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_page_size() -> usize {
    250
}

fn default_progress_flush() -> usize {
    50
}

fn default_fuzzy_window() -> usize {
    5000
}

fn default_fuzzy_threshold() -> f32 {
    0.85
}
