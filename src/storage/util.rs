use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the directory holding the identifier mapping files.
pub const METADATA_DIR: &str = "metadata";

/// Name of the private directory holding in-flight batches.
pub const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root directory of the archive
    pub root: PathBuf,
    /// Rows per block in data and mapping files
    pub rows_per_block: usize,
    /// Capacity of each identifier cache (per namespace and direction)
    pub id_cache_capacity: usize,
    /// Number of row-file footers kept open
    pub file_cache_capacity: usize,
    /// Maximum wait for the archive permit; waits forever when unset
    pub lock_timeout_ms: Option<u64>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            rows_per_block: 4096,
            id_cache_capacity: 10_000,
            file_cache_capacity: 1024,
            lock_timeout_ms: None,
        }
    }
}

impl ArchiveConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Self::default() }
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ArchiveConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows_per_block == 0 {
            return Err(Error::Config("rows_per_block must be positive".to_string()));
        }
        if self.id_cache_capacity == 0 || self.file_cache_capacity == 0 {
            return Err(Error::Config("cache capacities must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }
}
