//! Configuration for a replicated repository.

use crate::role::RepositoryType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Identity and role of the local repository.
    pub repository: RepositoryConfig,
    /// Synchronizer timing.
    pub sync: SyncConfig,
    /// Raw replication stream encoding.
    pub raw: RawCodecConfig,
    /// Interval between status log lines in the binary, in milliseconds.
    pub status_interval_ms: u64,
}

/// Identity and role of the local repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository name, shared by the primary and its replicas.
    pub id: String,
    /// Role of this instance.
    pub repository_type: RepositoryType,
    /// Whether an online backup accepts write-through commits.
    pub allow_backup_writes: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            id: "repo1".to_string(),
            repository_type: RepositoryType::Primary,
            allow_backup_writes: false,
        }
    }
}

/// Timing of connect retries and replicated-commit retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait between connect/replicate attempts, in milliseconds.
    pub retry_interval_ms: u64,
    /// Retries of a failed commit or lock apply after the first attempt.
    pub max_recommits: u32,
    /// Wait before retrying a failed commit or lock apply, in milliseconds.
    pub recommit_interval_ms: u64,
    /// Use bulk raw replication instead of incremental replication.
    pub raw_replication: bool,
    /// Backoff used between connect/replicate attempts.
    pub backoff: BackoffPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 3000,
            max_recommits: 10,
            recommit_interval_ms: 1000,
            raw_replication: true,
            backoff: BackoffPolicy::Fixed,
        }
    }
}

impl SyncConfig {
    /// Base retry interval.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Delay before a replicated-commit retry.
    pub fn recommit_interval(&self) -> Duration {
        Duration::from_millis(self.recommit_interval_ms)
    }

    /// Wait before the connect attempt following `failures` consecutive failures.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        self.backoff.delay(self.retry_interval_ms, failures)
    }
}

/// How the connect retry wait grows with consecutive failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffPolicy {
    /// Always wait the base interval.
    #[default]
    Fixed,
    /// Double the base interval per failure up to `max_ms`, with 10% jitter.
    CappedExponential {
        /// Upper bound of the wait, in milliseconds.
        max_ms: u64,
    },
}

impl BackoffPolicy {
    /// Delay for the given base interval and number of consecutive failures.
    pub fn delay(&self, base_ms: u64, failures: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed => Duration::from_millis(base_ms),
            BackoffPolicy::CappedExponential { max_ms } => {
                let exp = failures.saturating_sub(1).min(20);
                let raw = base_ms.saturating_mul(1u64 << exp).min(max_ms);
                let jitter_range = raw / 10;
                let jitter = if jitter_range > 0 {
                    rand::thread_rng().gen_range(0..=jitter_range)
                } else {
                    0
                };
                Duration::from_millis(raw.saturating_sub(jitter))
            }
        }
    }
}

/// Compression used for raw replication streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawCompression {
    /// Uncompressed.
    None,
    /// LZ4 frame compression.
    #[default]
    Lz4,
    /// Zstandard compression.
    Zstd,
}

/// Raw replication stream encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCodecConfig {
    /// Compression algorithm.
    pub compression: RawCompression,
    /// Zstd level, 1-22.
    pub zstd_level: i32,
    /// Largest uncompressed body a replica accepts, in bytes.
    pub max_body_bytes: u64,
}

impl Default for RawCodecConfig {
    fn default() -> Self {
        Self {
            compression: RawCompression::Lz4,
            zstd_level: 3,
            max_body_bytes: 512 * 1024 * 1024,
        }
    }
}

impl ReplConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the synchronizer cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ReplError;

        if self.repository.id.trim().is_empty() {
            return Err(ReplError::config("repository id must not be empty"));
        }
        if self.sync.retry_interval_ms == 0 {
            return Err(ReplError::config("retry_interval_ms must be positive"));
        }
        if let BackoffPolicy::CappedExponential { max_ms } = self.sync.backoff {
            if max_ms < self.sync.retry_interval_ms {
                return Err(ReplError::config(
                    "backoff max_ms must not be below retry_interval_ms",
                ));
            }
        }
        if self.raw.max_body_bytes == 0 {
            return Err(ReplError::config("raw max_body_bytes must be positive"));
        }
        if !(1..=22).contains(&self.raw.zstd_level) {
            return Err(ReplError::config(format!(
                "zstd_level {} out of range 1-22",
                self.raw.zstd_level
            )));
        }
        Ok(())
    }
}
