//! Retention and storage level policy.

use std::sync::Arc;

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::fileset::{Fid, FileSet, FileSetManager};
use crate::row::Key;

/// Partition boundaries of the retention policy at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Partitions below this fid are expired.
    pub min_fid: Fid,
    /// Partitions below this fid live on level 2.
    pub mid_fid: Fid,
    /// Partitions below this fid live on level 1.
    pub max_fid: Fid,
}

/// What [`apply`] did to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionAction {
    Kept,
    Expired,
    Relocated { from: u8, to: u8 },
}

fn fid_floor(key: Key, width: i64) -> Fid {
    key.div_euclid(width).clamp(Fid::MIN as i64, Fid::MAX as i64) as Fid
}

impl Retention {
    /// Everything on level 0 and nothing expires.
    pub fn unlimited() -> Self {
        Self {
            min_fid: Fid::MIN,
            mid_fid: Fid::MIN,
            max_fid: Fid::MIN,
        }
    }

    pub fn snapshot(cfg: Option<RetentionConfig>, width: i64, now: Key) -> Self {
        let Some(cfg) = cfg else {
            return Self::unlimited();
        };
        Self {
            min_fid: fid_floor(now.saturating_sub(cfg.keep2), width),
            mid_fid: fid_floor(now.saturating_sub(cfg.keep1), width),
            max_fid: fid_floor(now.saturating_sub(cfg.keep0), width),
        }
    }

    /// Storage level partition `fid` belongs on, `None` once it expired.
    pub fn level_of(&self, fid: Fid) -> Option<u8> {
        if fid >= self.max_fid {
            Some(0)
        } else if fid >= self.mid_fid {
            Some(1)
        } else if fid >= self.min_fid {
            Some(2)
        } else {
            None
        }
    }

    pub fn is_expired(&self, fid: Fid) -> bool {
        fid < self.min_fid
    }
}

/// Expires or relocates an installed partition that the commit does not
/// otherwise touch.
pub fn apply(mgr: &FileSetManager, retention: &Retention, set: &Arc<FileSet>) -> Result<RetentionAction> {
    let Some(level) = retention.level_of(set.fid) else {
        mgr.remove(set.fid)?;
        tracing::info!(fid = set.fid, level = set.level, "expired file-set removed");
        return Ok(RetentionAction::Expired);
    };
    match mgr.relocate(set, level)? {
        Some(moved) => Ok(RetentionAction::Relocated {
            from: set.level,
            to: moved.level,
        }),
        None => Ok(RetentionAction::Kept),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockInfo, BlockWriter, Compression, DataCols};
    use crate::fileset::catalog::Catalog;
    use crate::fileset::{index, Tiers};
    use crate::row::{Cell, TableId, Value};
    use crate::schema::{Column, ColumnType, Schema};
    use tempfile::TempDir;

    #[test]
    fn test_levels_from_snapshot() {
        let rtn = Retention::snapshot(
            Some(RetentionConfig {
                keep0: 20,
                keep1: 50,
                keep2: 100,
            }),
            10,
            1000,
        );
        assert_eq!((rtn.min_fid, rtn.mid_fid, rtn.max_fid), (90, 95, 98));
        assert_eq!(rtn.level_of(100), Some(0));
        assert_eq!(rtn.level_of(98), Some(0));
        assert_eq!(rtn.level_of(97), Some(1));
        assert_eq!(rtn.level_of(94), Some(2));
        assert_eq!(rtn.level_of(90), Some(2));
        assert_eq!(rtn.level_of(89), None);
        assert!(rtn.is_expired(89));
    }

    #[test]
    fn test_no_retention_keeps_everything_hot() {
        let rtn = Retention::snapshot(None, 10, 1000);
        assert_eq!(rtn.level_of(Fid::MIN), Some(0));
        assert!(!rtn.is_expired(-5));
    }

    #[test]
    fn test_negative_keys_floor() {
        let rtn = Retention::snapshot(Some(RetentionConfig::keep(15)), 10, 0);
        assert_eq!(rtn.min_fid, -2);
    }

    fn install(mgr: &FileSetManager, fid: Fid) -> Result<Arc<FileSet>> {
        let table = TableId::normal(1);
        let schema = Schema::new(1, vec![Column::new(2, ColumnType::BigInt)])?;
        let mut cols = DataCols::new(&schema);
        cols.push_row(fid as i64 * 10, vec![Cell::Norm(Value::BigInt(1))])?;

        let mut session = mgr.open_session(None, fid, 0)?;
        let mut writer = BlockWriter::new(Compression::None);
        let meta = writer.write(table, &cols, &mut session.data, &mut session.sma, true, false)?;
        let mut info = BlockInfo::new(table);
        info.entries.push(crate::block::BlockEntry::Leaf(meta));
        session.idxs.extend(index::write_block_info(&mut session.head, &info)?);
        mgr.finish(session)
    }

    #[test]
    fn test_apply_expires_and_relocates() -> Result<()> {
        let root = TempDir::new()?;
        let hot = root.path().join("hot");
        let warm = root.path().join("warm");
        let catalog = Arc::new(Catalog::open(root.path(), 100)?);
        let tiers = Tiers::open(vec![vec![hot.clone()], vec![warm.clone()]])?;
        let mgr = FileSetManager::new(tiers, catalog.clone(), 1 << 15);

        let old = install(&mgr, 1)?;
        let aging = install(&mgr, 5)?;
        let fresh = install(&mgr, 9)?;

        let rtn = Retention {
            min_fid: 3,
            mid_fid: 3,
            max_fid: 8,
        };
        assert_eq!(apply(&mgr, &rtn, &old)?, RetentionAction::Expired);
        assert!(catalog.get(1)?.is_none());
        assert!(old.paths().iter().all(|p| !p.exists()));

        assert_eq!(apply(&mgr, &rtn, &aging)?, RetentionAction::Relocated { from: 0, to: 1 });
        let moved = catalog.get(5)?.ok_or_else(|| crate::error::Error::NotFound("fid 5".into()))?;
        assert_eq!(moved.dir, warm);
        assert!(moved.paths().iter().all(|p| p.exists()));

        assert_eq!(apply(&mgr, &rtn, &fresh)?, RetentionAction::Kept);
        Ok(())
    }
}
