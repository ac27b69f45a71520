use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::core::Memtable;
use crate::error::Result;
use crate::fileset::Fid;

/// Immutable snapshot of a memtable being committed.
///
/// Besides the rows it remembers which partitions have already been
/// installed, so a commit retried after a failure resumes instead of merging
/// the same rows twice.
#[derive(Debug)]
pub struct FrozenMemtable {
    memtable: Arc<Memtable>,
    generation: u64,
    committed_fids: Mutex<BTreeSet<Fid>>,
    deletes_committed: AtomicBool,
}

impl FrozenMemtable {
    pub(super) fn new(memtable: Arc<Memtable>, generation: u64) -> Self {
        Self {
            memtable,
            generation,
            committed_fids: Mutex::new(BTreeSet::new()),
            deletes_committed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn mark_committed(&self, fid: Fid) -> Result<()> {
        self.committed_fids.lock()?.insert(fid);
        Ok(())
    }

    pub fn is_committed(&self, fid: Fid) -> Result<bool> {
        Ok(self.committed_fids.lock()?.contains(&fid))
    }

    pub fn mark_deletes_committed(&self) {
        self.deletes_committed.store(true, Ordering::SeqCst);
    }

    pub fn deletes_committed(&self) -> bool {
        self.deletes_committed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ActiveMemtable;
    use super::*;
    use crate::row::{Cell, Row, TableId};

    #[test]
    fn test_freeze_hands_over_rows() -> Result<()> {
        let active = ActiveMemtable::new(4);
        active.put(TableId::normal(1), Row::put(10, 1, vec![Cell::Null]))?;

        let frozen = active.freeze()?;
        assert_eq!(frozen.generation(), 4);
        assert!(!frozen.is_empty());
        assert_eq!(frozen.memtable().row_count(), 1);
        assert!(active.put(TableId::normal(1), Row::put(11, 1, vec![Cell::Null])).is_err());
        Ok(())
    }

    #[test]
    fn test_committed_partitions_are_remembered() -> Result<()> {
        let frozen = ActiveMemtable::new(0).freeze()?;
        assert!(!frozen.is_committed(3)?);
        frozen.mark_committed(3)?;
        assert!(frozen.is_committed(3)?);
        assert!(!frozen.deletes_committed());
        frozen.mark_deletes_committed();
        assert!(frozen.deletes_committed());
        Ok(())
    }
}
