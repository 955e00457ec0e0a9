use crate::errors::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for one migration run.
///
/// Every field has a default so a config file only needs to name what it
/// overrides.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Maximum number of graph tasks running at once.
    pub parallel_tasks: usize,
    /// Concurrent extraction cursors per transfer task.
    pub transfer_workers: usize,
    /// Rows requested per page (`{limit}`).
    pub page_size: usize,
    /// Maximum rows per multi-row insert statement.
    pub insert_batch: usize,
    pub connection_attempts: u32,
    pub connection_interval_ms: u64,
    pub source_pool_size: usize,
    pub target_pool_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            parallel_tasks: 10,
            transfer_workers: 3,
            page_size: 50_000,
            insert_batch: 2_500,
            connection_attempts: 60,
            connection_interval_ms: 1_000,
            source_pool_size: 10,
            target_pool_size: 10,
        }
    }
}

impl MigrationConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: MigrationConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("parallel_tasks", self.parallel_tasks),
            ("transfer_workers", self.transfer_workers),
            ("page_size", self.page_size),
            ("insert_batch", self.insert_batch),
            ("source_pool_size", self.source_pool_size),
            ("target_pool_size", self.target_pool_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(MigrationError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.connection_attempts == 0 {
            return Err(MigrationError::Config(
                "connection_attempts must be at least 1".to_string(),
            ));
        }
        if self.insert_batch > self.page_size {
            return Err(MigrationError::Config(format!(
                "insert_batch ({}) may not exceed page_size ({})",
                self.insert_batch, self.page_size
            )));
        }
        Ok(())
    }

    pub fn connection_interval(&self) -> Duration {
        Duration::from_millis(self.connection_interval_ms)
    }
}
