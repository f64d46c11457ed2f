//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config
//! file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::memory::DEFAULT_BUFFERS_PER_POOL;
use crate::planner::{self, ChunkPlanner, LOCAL_BLOCK_SIZE, MAX_BLOCK_COUNT, REMOTE_BLOCK_SIZE};

/// Tunables for uploads, downloads and bulk encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for remote blob transfers.
    pub block_size: usize,
    /// Chunk size for local bulk encryption.
    pub local_block_size: usize,
    /// Highest block count the storage service accepts for one blob.
    pub max_blocks: u64,
    /// Worker count; `None` means available processors x 8.
    pub threads: Option<usize>,
    /// Retries allowed while a signed URL answers "forbidden".
    pub forbidden_retry_attempts: u32,
    pub forbidden_retry_delay_ms: u64,
    /// Wall-clock budget of the pre-flight policy activation probe.
    pub policy_activation_budget_ms: u64,
    pub policy_probe_interval_ms: u64,
    /// Live buffers per block size.
    pub max_buffers_per_pool: usize,
    /// Sliding window of the throughput estimate.
    pub speed_window_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: REMOTE_BLOCK_SIZE,
            local_block_size: LOCAL_BLOCK_SIZE,
            max_blocks: MAX_BLOCK_COUNT,
            threads: None,
            forbidden_retry_attempts: 30,
            forbidden_retry_delay_ms: 1_000,
            policy_activation_budget_ms: 30_000,
            policy_probe_interval_ms: 1_000,
            max_buffers_per_pool: DEFAULT_BUFFERS_PER_POOL,
            speed_window_ms: 5_000,
        }
    }
}

impl TransferConfig {
    /// Reads a JSON config file and validates it.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.block_size == 0 || self.local_block_size == 0 {
            return Err(TransferError::InvalidBlockSize);
        }
        if self.max_blocks == 0 {
            return Err(TransferError::Config("max_blocks must be at least 1".into()));
        }
        if self.threads == Some(0) {
            return Err(TransferError::Config("threads must be at least 1".into()));
        }
        if self.max_buffers_per_pool == 0 {
            return Err(TransferError::Config(
                "max_buffers_per_pool must be at least 1".into(),
            ));
        }
        if self.policy_probe_interval_ms == 0 {
            return Err(TransferError::Config(
                "policy_probe_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective worker count before clamping to the chunk count.
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(planner::default_threads)
    }

    pub fn remote_planner(&self) -> Result<ChunkPlanner, TransferError> {
        ChunkPlanner::new(self.block_size, self.max_blocks)
    }

    pub fn local_planner(&self) -> Result<ChunkPlanner, TransferError> {
        ChunkPlanner::new(self.local_block_size, u64::MAX)
    }

    pub fn forbidden_retry_delay(&self) -> Duration {
        Duration::from_millis(self.forbidden_retry_delay_ms)
    }

    pub fn policy_activation_budget(&self) -> Duration {
        Duration::from_millis(self.policy_activation_budget_ms)
    }

    pub fn policy_probe_interval(&self) -> Duration {
        Duration::from_millis(self.policy_probe_interval_ms)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.block_size, 4 * 1024 * 1024);
        assert_eq!(config.local_block_size, 64 * 1024);
        assert_eq!(config.max_blocks, 50_000);
        assert_eq!(config.forbidden_retry_attempts, 30);
        assert_eq!(config.forbidden_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.policy_activation_budget(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: TransferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TransferConfig::default());
    }

    #[test]
    fn partial_json_overrides() {
        let config: TransferConfig =
            serde_json::from_str(r#"{"block_size":1024,"threads":3}"#).unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.threads(), 3);
        assert_eq!(config.max_blocks, MAX_BLOCK_COUNT);
    }

    #[test]
    fn load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/transfer.json");
        let config = TransferConfig {
            threads: Some(2),
            block_size: 8192,
            ..TransferConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TransferConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"block_size":0}"#).unwrap();
        assert!(matches!(
            TransferConfig::load(&path),
            Err(TransferError::InvalidBlockSize)
        ));

        std::fs::write(&path, r#"{"threads":0}"#).unwrap();
        assert!(matches!(
            TransferConfig::load(&path),
            Err(TransferError::Config(_))
        ));

        std::fs::write(&path, r#"{"policy_probe_interval_ms":0}"#).unwrap();
        assert!(matches!(
            TransferConfig::load(&path),
            Err(TransferError::Config(msg)) if msg.contains("policy_probe_interval_ms")
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            TransferConfig::load(&path),
            Err(TransferError::Json(_))
        ));
    }
}
