//! # Configuration
//!
//! Recognized options for the queue layer, the flow generator, and the
//! capture workers. Loaded from a JSON file; every field has a default so
//! a partial file (or none at all) yields a runnable configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::flow::TimeoutConfig;

/// Queue-layer options shared by both subsystems.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of queue shards (one worker per shard).
    #[serde(default = "default_queue_count")]
    pub queue_count: usize,

    /// Capacity of each shard.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Interval between maintenance ticks delivered to every shard.
    #[serde(default = "default_tick_interval_second")]
    pub tick_interval_second: u64,
}

/// Flow generator options.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Number of flow-table shards; must be a power of two.
    #[serde(default = "default_hash_map_size")]
    pub hash_map_size: usize,

    /// Maximum concurrent flows across all shards.
    #[serde(default = "default_flow_limit_num")]
    pub flow_limit_num: u64,

    /// Initial timeout for newly created UDP flows.
    #[serde(default = "default_timeout_opening_second")]
    pub timeout_opening_second: u64,

    /// Reduced timeout applied once a reply direction is observed.
    #[serde(default = "default_timeout_established_rst_second")]
    pub timeout_established_rst_second: u64,
}

/// Capture worker options.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Total open-writer budget, divided evenly between workers.
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// Per-file size cap in megabytes.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Per-file duration cap in seconds.
    #[serde(default = "default_max_file_period_second")]
    pub max_file_period_second: u64,

    /// Writer block-buffer size in kilobytes.
    #[serde(default = "default_block_size_kb")]
    pub block_size_kb: usize,

    /// Whether captured TCP/IP checksums are written as-is.
    #[serde(default = "default_tcpip_checksum")]
    pub tcpip_checksum: bool,

    /// Output root; capture files land under `<base_directory>/<acl_gid>/`.
    #[serde(default = "default_base_directory")]
    pub base_directory: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

fn default_queue_count() -> usize {
    4
}
fn default_queue_size() -> usize {
    65536
}
fn default_tick_interval_second() -> u64 {
    1
}
fn default_hash_map_size() -> usize {
    1 << 16
}
fn default_flow_limit_num() -> u64 {
    1 << 20
}
fn default_timeout_opening_second() -> u64 {
    5
}
fn default_timeout_established_rst_second() -> u64 {
    30
}
fn default_max_concurrent_files() -> usize {
    5000
}
fn default_max_file_size_mb() -> u64 {
    25
}
fn default_max_file_period_second() -> u64 {
    300
}
fn default_block_size_kb() -> usize {
    64
}
fn default_tcpip_checksum() -> bool {
    false
}
fn default_base_directory() -> String {
    "/var/lib/flowtap/pcap".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            queue_count: default_queue_count(),
            queue_size: default_queue_size(),
            tick_interval_second: default_tick_interval_second(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            hash_map_size: default_hash_map_size(),
            flow_limit_num: default_flow_limit_num(),
            timeout_opening_second: default_timeout_opening_second(),
            timeout_established_rst_second: default_timeout_established_rst_second(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            max_concurrent_files: default_max_concurrent_files(),
            max_file_size_mb: default_max_file_size_mb(),
            max_file_period_second: default_max_file_period_second(),
            block_size_kb: default_block_size_kb(),
            tcpip_checksum: default_tcpip_checksum(),
            base_directory: default_base_directory(),
        }
    }
}

impl QueueConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_second)
    }
}

impl FlowConfig {
    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            opening: Duration::from_secs(self.timeout_opening_second),
            established_rst: Duration::from_secs(self.timeout_established_rst_second),
        }
    }
}

impl CaptureConfig {
    /// Size cap in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb << 20
    }

    /// Duration cap.
    pub fn max_file_period(&self) -> Duration {
        Duration::from_secs(self.max_file_period_second)
    }

    /// Writer buffer size in bytes.
    pub fn writer_buffer_size(&self) -> usize {
        self.block_size_kb << 10
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config {}: {}", path.as_ref().display(), e))?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue.queue_count == 0 {
            return Err("queue_count must be positive".to_string());
        }
        if self.queue.queue_size == 0 {
            return Err("queue_size must be positive".to_string());
        }
        if self.flow.hash_map_size == 0 || !self.flow.hash_map_size.is_power_of_two() {
            return Err(format!(
                "hash_map_size must be a power of two, got {}",
                self.flow.hash_map_size
            ));
        }
        if self.capture.max_file_size_mb == 0 {
            return Err("max_file_size_mb must be positive".to_string());
        }
        if self.capture.block_size_kb == 0 {
            return Err("block_size_kb must be positive".to_string());
        }
        Ok(())
    }
}
