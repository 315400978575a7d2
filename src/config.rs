//! Configuration for the transaction manager and its durable log
//!
//! Configuration is plain data: build it in code, start from one of the
//! presets, or load it from a JSON file with camelCase keys:
//!
//! ```json
//! {
//!   "serverName": "node-a",
//!   "txLogDir": "/var/lib/keystone",
//!   "automaticRecovery": true,
//!   "timeoutInSeconds": 30,
//!   "heuristicDecision": "rollback",
//!   "keypointInterval": 64,
//!   "log": { "fsyncIntervalMs": 0 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TxError};

/// Floor for the timeout scanner interval (seconds)
pub const MIN_TIMEOUT_SCAN_INTERVAL_SECS: u64 = 10;

/// Outcome applied to in-doubt branches that have no log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicDecision {
    Commit,
    Rollback,
}

impl Default for HeuristicDecision {
    fn default() -> Self {
        HeuristicDecision::Rollback
    }
}

/// Group-commit and deferred fsync behaviour of the file log.
///
/// # Presets
///
/// - [`LogConfig::default()`] - Balanced (50ms fsync interval)
/// - [`LogConfig::synchronous()`] - fsync every batch, lowest latency to durability
/// - [`LogConfig::high_throughput()`] - Larger batches, longer fsync interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// Maximum time to wait before flushing a batch (milliseconds)
    pub batch_timeout_ms: u64,
    /// Maximum number of records in a batch before forcing flush
    pub max_batch_size: usize,
    /// How often to fsync the log file (milliseconds). 0 = sync per batch.
    pub fsync_interval_ms: u64,
    /// Maximum bytes to buffer before forcing an immediate fsync
    pub max_unfsynced_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 5,
            max_batch_size: 128,
            fsync_interval_ms: 50,
            max_unfsynced_bytes: 1 << 20, // 1 MB
        }
    }
}

impl LogConfig {
    /// fsync after every batch
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    /// Larger batches and a longer fsync interval
    pub fn high_throughput() -> Self {
        Self {
            batch_timeout_ms: 10,
            max_batch_size: 512,
            fsync_interval_ms: 100,
            max_unfsynced_bytes: 4 << 20, // 4 MB
        }
    }
}

/// Transaction manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TmConfig {
    /// Identity of this server; hashed into every global transaction id
    pub server_name: String,
    /// Instance name recorded in log entries
    pub instance_name: String,
    /// Run recovery automatically at startup
    pub automatic_recovery: bool,
    /// Default transaction timeout (0 = infinite)
    pub timeout_in_seconds: u32,
    /// Directory holding the transaction log
    pub tx_log_dir: PathBuf,
    /// Outcome for in-doubt branches with no log entry
    pub heuristic_decision: HeuristicDecision,
    /// How long to retry commit on transient failures (negative = forever, 0 = none)
    pub retry_timeout_in_seconds: i64,
    /// Completed transactions between log compactions (0 = never)
    pub keypoint_interval: u64,
    /// Let a single non-XA resource commit one-phase after the XA branches prepared
    pub use_last_agent_optimization: bool,
    /// Timeout scanner wake-up interval, floored at 10 seconds
    pub timeout_scan_interval_secs: u64,
    /// Pause between commit retries (milliseconds)
    pub commit_retry_wait_ms: u64,
    /// Let a local transaction marked rollback-only still be promoted to a
    /// distributed one; the mark is kept and the transaction still rolls back
    pub disable_status_check_on_switch_to_xa: bool,
    /// File log tuning
    pub log: LogConfig,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            server_name: "keystone".to_string(),
            instance_name: "server".to_string(),
            automatic_recovery: false,
            timeout_in_seconds: 0,
            tx_log_dir: PathBuf::from("./txlog"),
            heuristic_decision: HeuristicDecision::Rollback,
            retry_timeout_in_seconds: 0,
            keypoint_interval: 64,
            use_last_agent_optimization: true,
            timeout_scan_interval_secs: MIN_TIMEOUT_SCAN_INTERVAL_SECS,
            commit_retry_wait_ms: 100,
            disable_status_check_on_switch_to_xa: false,
            log: LogConfig::default(),
        }
    }
}

impl TmConfig {
    /// Configuration rooted at the given log directory
    pub fn with_log_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            tx_log_dir: dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: TmConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(TxError::Config("serverName must not be empty".into()));
        }
        if self.log.max_batch_size == 0 {
            return Err(TxError::Config("log.maxBatchSize must be positive".into()));
        }
        Ok(())
    }

    /// Effective scanner interval after applying the floor
    pub fn effective_scan_interval_secs(&self) -> u64 {
        self.timeout_scan_interval_secs.max(MIN_TIMEOUT_SCAN_INTERVAL_SECS)
    }
}
