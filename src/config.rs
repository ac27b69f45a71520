use std::path::PathBuf;

use crate::block::Compression;
use crate::error::{Error, Result};

/// Milliseconds in one day, the default key precision.
pub const MS_PER_DAY: i64 = 86_400_000;

/// Configuration for a storage unit and its commit engine
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Directory path for the storage unit (default: ./tsdb)
    pub dir: PathBuf,

    /// Blocks with fewer rows are kept in the last file (default: 100)
    pub min_rows: usize,

    /// Upper bound on rows per block (default: 4096)
    pub max_rows: usize,

    /// Maximum sub-blocks under one super-block (default: 8)
    pub max_sub_blocks: usize,

    /// Last files at or above this size are not reused in place (default: 32KB)
    pub last_file_threshold: u64,

    /// Compression applied to column values and bitmaps (default: Lz4)
    pub compression: Compression,

    /// Newer writes replace older rows at equal keys (default: true)
    pub update: bool,

    /// Width of one partition in key units (default: 10 days in ms)
    pub partition_width: i64,

    /// Retention and tiering, disabled when unset (default: None)
    pub retention: Option<RetentionConfig>,

    /// Directories per storage level; level 0 defaults to `dir`
    pub tiers: Vec<Vec<PathBuf>>,

    /// Catalog edits between snapshot rewrites (default: 100)
    pub catalog_snapshot_interval: u32,
}

/// Age limits for each storage level, in key units.
///
/// Partitions younger than `keep0` live on level 0, younger than `keep1` on
/// level 1, younger than `keep2` on level 2. Anything older is expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub keep0: i64,
    pub keep1: i64,
    pub keep2: i64,
}

impl RetentionConfig {
    /// Single-tier retention that expires data older than `keep`.
    pub fn keep(keep: i64) -> Self {
        Self {
            keep0: keep,
            keep1: keep,
            keep2: keep,
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tsdb"),
            min_rows: 100,
            max_rows: 4096,
            max_sub_blocks: 8,
            last_file_threshold: 32 * 1024, // 32KB
            compression: Compression::Lz4,
            update: true,
            partition_width: 10 * MS_PER_DAY,
            retention: None,
            tiers: Vec::new(),
            catalog_snapshot_interval: 100,
        }
    }
}

impl CommitConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the last-file row threshold
    pub fn min_rows(mut self, rows: usize) -> Self {
        self.min_rows = rows;
        self
    }

    /// Set the maximum rows per block
    pub fn max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows;
        self
    }

    /// Set the sub-block limit per super-block
    pub fn max_sub_blocks(mut self, count: usize) -> Self {
        self.max_sub_blocks = count;
        self
    }

    /// Set the size above which last files are rewritten
    pub fn last_file_threshold(mut self, bytes: u64) -> Self {
        self.last_file_threshold = bytes;
        self
    }

    /// Set the block compression algorithm
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Enable or disable update semantics at duplicate keys
    pub fn update(mut self, enabled: bool) -> Self {
        self.update = enabled;
        self
    }

    /// Set the partition width in key units
    pub fn partition_width(mut self, width: i64) -> Self {
        self.partition_width = width;
        self
    }

    /// Configure retention and tiering
    pub fn retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Set directories for one storage level
    pub fn tier(mut self, level: usize, dirs: Vec<PathBuf>) -> Self {
        while self.tiers.len() <= level {
            self.tiers.push(Vec::new());
        }
        self.tiers[level] = dirs;
        self
    }

    /// Set how many catalog edits accumulate before a snapshot
    pub fn catalog_snapshot_interval(mut self, edits: u32) -> Self {
        self.catalog_snapshot_interval = edits;
        self
    }

    /// Directories per level with level 0 falling back to `dir`.
    pub fn resolved_tiers(&self) -> Vec<Vec<PathBuf>> {
        let mut tiers = self.tiers.clone();
        if tiers.is_empty() {
            tiers.push(Vec::new());
        }
        if tiers[0].is_empty() {
            tiers[0].push(self.dir.clone());
        }
        tiers
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rows == 0 {
            return Err(Error::InvalidOperation("max_rows must be positive".into()));
        }
        if self.min_rows > self.max_rows {
            return Err(Error::InvalidOperation(format!(
                "min_rows {} exceeds max_rows {}",
                self.min_rows, self.max_rows
            )));
        }
        if self.max_sub_blocks == 0 || self.max_sub_blocks > u8::MAX as usize {
            return Err(Error::InvalidOperation(format!(
                "max_sub_blocks {} out of range",
                self.max_sub_blocks
            )));
        }
        if self.partition_width <= 0 {
            return Err(Error::InvalidOperation(
                "partition_width must be positive".into(),
            ));
        }
        if let Some(rtn) = self.retention {
            if !(rtn.keep0 <= rtn.keep1 && rtn.keep1 <= rtn.keep2) {
                return Err(Error::InvalidOperation(
                    "retention must satisfy keep0 <= keep1 <= keep2".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CommitConfig::default();
        assert_eq!(config.dir, PathBuf::from("./tsdb"));
        assert_eq!(config.min_rows, 100);
        assert_eq!(config.max_rows, 4096);
        assert_eq!(config.max_sub_blocks, 8);
        assert_eq!(config.last_file_threshold, 32 * 1024);
        assert!(config.update);
        assert!(config.retention.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CommitConfig::new("/tmp/unit")
            .min_rows(2)
            .max_rows(4)
            .compression(Compression::Zstd)
            .update(false)
            .partition_width(1000)
            .retention(RetentionConfig::keep(5000));

        assert_eq!(config.dir, PathBuf::from("/tmp/unit"));
        assert_eq!(config.min_rows, 2);
        assert_eq!(config.max_rows, 4);
        assert_eq!(config.compression, Compression::Zstd);
        assert!(!config.update);
        assert_eq!(config.partition_width, 1000);
        assert_eq!(config.retention, Some(RetentionConfig::keep(5000)));
    }

    #[test]
    fn test_resolved_tiers_fall_back_to_dir() {
        let config = CommitConfig::new("/data/unit").tier(1, vec![PathBuf::from("/cold")]);
        let tiers = config.resolved_tiers();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0], vec![PathBuf::from("/data/unit")]);
        assert_eq!(tiers[1], vec![PathBuf::from("/cold")]);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        assert!(CommitConfig::default().min_rows(10).max_rows(5).validate().is_err());
        assert!(CommitConfig::default().max_rows(0).min_rows(0).validate().is_err());
        assert!(CommitConfig::default().max_sub_blocks(0).validate().is_err());
        assert!(CommitConfig::default().partition_width(0).validate().is_err());
        let rtn = RetentionConfig {
            keep0: 10,
            keep1: 5,
            keep2: 20,
        };
        assert!(CommitConfig::default().retention(rtn).validate().is_err());
    }
}
