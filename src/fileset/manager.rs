//! File-Set Lifecycle Manager.
//!
//! A commit never edits an installed file-set in a way its readers could
//! observe. Each partition touched by a commit gets a [`WriteSession`]:
//!
//! - the head file is always new;
//! - the data and sma files are appended to in place when the partition
//!   stays on the same level, since readers only look at the extent recorded
//!   in the catalog;
//! - the last file is appended to in place only while it is small, otherwise
//!   its blocks are merged or moved into a fresh one.
//!
//! [`FileSetManager::finish`] makes the new version durable and installs it
//! through the catalog; [`FileSetManager::revert`] puts every touched file
//! back to its recorded extent.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::catalog::Catalog;
use super::file::{DataFile, FileKind, FileMeta};
use super::index::{self, BlockIdx};
use super::reader::FileSetReader;
use super::tiers::{Disk, Tiers};
use super::{Fid, FileSet};
use crate::error::{Error, Result};

/// Files being written for one new version of a partition.
#[derive(Debug)]
pub struct WriteSession {
    pub fid: Fid,
    pub txn: u64,
    pub disk: Disk,
    pub head: DataFile,
    pub data: DataFile,
    pub last: DataFile,
    pub sma: DataFile,
    /// New data blocks go to the file the old set already uses.
    pub d_file_same: bool,
    /// New last blocks go to the file the old set already uses.
    pub l_file_same: bool,
    /// Reader over the version being replaced.
    pub old: Option<FileSetReader>,
    /// Index entries of the tables written so far, in table order.
    pub idxs: Vec<BlockIdx>,
}

impl WriteSession {
    pub fn level(&self) -> u8 {
        self.disk.level
    }

    fn into_files(self) -> [DataFile; 4] {
        [self.head, self.data, self.last, self.sma]
    }
}

pub struct FileSetManager {
    tiers: Tiers,
    catalog: Arc<Catalog>,
    last_file_threshold: u64,
}

impl FileSetManager {
    pub fn new(tiers: Tiers, catalog: Arc<Catalog>, last_file_threshold: u64) -> Self {
        Self {
            tiers,
            catalog,
            last_file_threshold,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn tiers(&self) -> &Tiers {
        &self.tiers
    }

    /// Opens the files for a new version of partition `fid` on `level`.
    pub fn open_session(
        &self,
        old: Option<Arc<FileSet>>,
        fid: Fid,
        level: u8,
    ) -> Result<WriteSession> {
        let reuse = match &old {
            Some(set) => self.tiers.effective_level(level) == Some(set.level),
            None => false,
        };
        let disk = match (&old, reuse) {
            (Some(set), true) => Disk {
                level: set.level,
                id: set.disk_id,
                dir: set.dir.clone(),
            },
            _ => self.tiers.alloc(level)?,
        };
        let txn = self.catalog.next_txn()?;
        let reader = old.map(FileSetReader::open).transpose()?;

        let mut opened: Vec<DataFile> = Vec::with_capacity(4);
        let result = (|| -> Result<(bool, bool)> {
            opened.push(DataFile::create(&disk.dir, fid, txn, FileKind::Head)?);

            let set = reader.as_ref().map(FileSetReader::set).filter(|_| reuse);
            let (d_same, l_same) = match set {
                Some(set) => (true, set.last().info.size < self.last_file_threshold),
                None => (false, false),
            };
            let reopen = |meta: Option<&FileMeta>, kind| match meta {
                Some(meta) => DataFile::open_append(&disk.dir, fid, meta),
                None => DataFile::create(&disk.dir, fid, txn, kind),
            };
            opened.push(reopen(set.filter(|_| d_same).map(|s| s.data()), FileKind::Data)?);
            opened.push(reopen(set.filter(|_| l_same).map(|s| s.last()), FileKind::Last)?);
            opened.push(reopen(set.filter(|_| d_same).map(|s| s.sma()), FileKind::Sma)?);
            Ok((d_same, l_same))
        })();

        let (d_file_same, l_file_same) = match result {
            Ok(flags) => flags,
            Err(e) => {
                revert_files(opened);
                return Err(e);
            }
        };

        let [head, data, last, sma]: [DataFile; 4] = opened
            .try_into()
            .map_err(|_| Error::InvalidState(format!("write session for {} is incomplete", fid)))?;
        tracing::debug!(
            fid = fid,
            txn = txn,
            level = disk.level,
            d_file_same = d_file_same,
            l_file_same = l_file_same,
            "write session opened"
        );
        Ok(WriteSession {
            fid,
            txn,
            disk,
            head,
            data,
            last,
            sma,
            d_file_same,
            l_file_same,
            old: reader,
            idxs: Vec::new(),
        })
    }

    /// Completes a session: writes the block index and headers, syncs, and
    /// installs the new version. Files of the old version that the new one
    /// does not reuse are deleted afterwards.
    pub fn finish(&self, mut session: WriteSession) -> Result<Arc<FileSet>> {
        if let Err(e) = Self::seal(&mut session) {
            self.revert(session);
            return Err(e);
        }

        let set = FileSet {
            fid: session.fid,
            level: session.disk.level,
            disk_id: session.disk.id,
            dir: session.disk.dir.clone(),
            files: [
                session.head.meta(),
                session.data.meta(),
                session.last.meta(),
                session.sma.meta(),
            ],
        };
        let old = match self.catalog.install(set.clone()) {
            Ok(old) => old,
            Err(e) => {
                self.revert(session);
                return Err(e);
            }
        };
        drop(session);

        tracing::info!(
            fid = set.fid,
            level = set.level,
            rows = set.total_rows(),
            blocks = set.data().info.total_blocks + set.last().info.total_blocks,
            "file-set installed"
        );
        if let Some(old) = old {
            remove_stale(&old, &set);
        }
        Ok(Arc::new(set))
    }

    fn seal(session: &mut WriteSession) -> Result<()> {
        index::write_index(&mut session.head, &session.idxs)?;
        for file in [
            &mut session.head,
            &mut session.data,
            &mut session.last,
            &mut session.sma,
        ] {
            file.write_header()?;
            file.sync()?;
        }
        Ok(())
    }

    /// Discards everything a session wrote; the catalog still names the old
    /// version.
    ///
    /// A poisoned catalog may have made the session durable, so its files are
    /// left as they are and the next open sorts them out.
    pub fn revert(&self, session: WriteSession) {
        if self.catalog.is_poisoned() {
            tracing::error!(
                fid = session.fid,
                txn = session.txn,
                "catalog poisoned, leaving write session files in place"
            );
            return;
        }
        tracing::warn!(fid = session.fid, txn = session.txn, "reverting write session");
        revert_files(session.into_files());
    }

    /// Drops a partition from the catalog and deletes its files.
    pub fn remove(&self, fid: Fid) -> Result<Option<Arc<FileSet>>> {
        let old = self.catalog.remove(fid)?;
        if let Some(set) = &old {
            for path in set.paths() {
                remove_file(&path);
            }
        }
        Ok(old)
    }

    /// Copies partition `set` to a directory on `level` and installs the
    /// copy. Returns `None` when no different level is available.
    pub fn relocate(&self, set: &Arc<FileSet>, level: u8) -> Result<Option<Arc<FileSet>>> {
        match self.tiers.effective_level(level) {
            Some(effective) if effective != set.level => {}
            _ => return Ok(None),
        }
        let disk = self.tiers.alloc(level)?;
        let mut copied = Vec::with_capacity(4);
        let result = (|| -> Result<()> {
            for meta in &set.files {
                let from = set.path(meta);
                let to = disk.dir.join(meta.file_name(set.fid));
                copied.push(to.clone());
                copy_extent(&from, &to, meta.info.size)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            for path in &copied {
                remove_file(path);
            }
            return Err(e);
        }

        let moved = FileSet {
            fid: set.fid,
            level: disk.level,
            disk_id: disk.id,
            dir: disk.dir.clone(),
            files: set.files,
        };
        if let Err(e) = self.catalog.install(moved.clone()) {
            if !self.catalog.is_poisoned() {
                for path in &copied {
                    remove_file(path);
                }
            }
            return Err(e);
        }
        remove_stale(set, &moved);
        tracing::info!(fid = set.fid, from = set.level, to = disk.level, "file-set relocated");
        Ok(Some(Arc::new(moved)))
    }

    /// Deletes files in the storage directories that the catalog does not
    /// reference, left behind by commits that did not finish.
    pub fn remove_orphans(&self) -> Result<usize> {
        let state = self.catalog.state()?;
        let mut removed = 0;
        for dir in self.tiers.dirs() {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if !is_engine_file(&path) {
                    continue;
                }
                let live = state.sets.values().any(|set| set.owns(&path))
                    || state.del.as_ref().map_or(false, |del| {
                        self.catalog.dir().join(del.file_name(0)) == path
                    });
                if !live {
                    tracing::warn!(path = %path.display(), "removing orphaned file");
                    remove_file(&path);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn is_engine_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    let known = matches!(ext, "head" | "data" | "last" | "sma" | "del");
    known && stem.contains("ver")
}

fn copy_extent(from: &Path, to: &Path, size: u64) -> Result<()> {
    let copied = fs::copy(from, to)?;
    let file = fs::OpenOptions::new().write(true).open(to)?;
    if copied != size {
        file.set_len(size)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Deletes files of `old` that `new` does not reuse.
fn remove_stale(old: &FileSet, new: &FileSet) {
    for path in old.paths() {
        if !new.owns(&path) {
            remove_file(&path);
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}

fn revert_files(files: impl IntoIterator<Item = DataFile>) {
    for file in files {
        let path = file.path().to_path_buf();
        if let Err(e) = file.revert() {
            tracing::warn!(path = %path.display(), error = %e, "failed to revert file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockInfo, BlockWriter, Compression, DataCols};
    use crate::row::{Cell, TableId, Value};
    use crate::schema::{Column, ColumnType, Schema};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn manager(root: &Path, threshold: u64) -> Result<FileSetManager> {
        let tiers = Tiers::open(vec![vec![root.join("t0")], vec![root.join("t1")]])?;
        let catalog = Arc::new(Catalog::open(root, 100)?);
        Ok(FileSetManager::new(tiers, catalog, threshold))
    }

    fn write_table(session: &mut WriteSession, keys: &[i64], last: bool) -> Result<()> {
        let schema = Schema::new(1, vec![Column::new(2, ColumnType::Int)])?;
        let mut cols = DataCols::new(&schema);
        for k in keys {
            cols.push_row(*k, vec![Cell::Norm(Value::Int(*k as i32))])?;
        }
        let table = TableId::normal(1);
        let mut writer = BlockWriter::new(Compression::Lz4);
        let dst = if last {
            &mut session.last
        } else {
            &mut session.data
        };
        let meta = writer.write(table, &cols, dst, &mut session.sma, true, last)?;
        let mut info = BlockInfo::new(table);
        info.entries.push(crate::block::BlockEntry::Leaf(meta));
        let idx = index::write_block_info(&mut session.head, &info)?;
        session.idxs.extend(idx);
        Ok(())
    }

    #[test]
    fn test_fresh_session_installs() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let mut session = mgr.open_session(None, 0, 0)?;
        assert!(!session.d_file_same && !session.l_file_same);
        write_table(&mut session, &[1, 2, 3], false)?;

        let set = mgr.finish(session)?;
        assert_eq!(mgr.catalog().get(0)?, Some(set.clone()));
        assert_eq!(set.data().info.total_rows, 3);
        for path in set.paths() {
            assert!(path.exists());
        }
        Ok(())
    }

    #[test]
    fn test_same_level_reuses_data_and_small_last() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let mut session = mgr.open_session(None, 0, 0)?;
        write_table(&mut session, &[1], true)?;
        let first = mgr.finish(session)?;

        let session = mgr.open_session(Some(first.clone()), 0, 0)?;
        assert!(session.d_file_same && session.l_file_same);
        assert_eq!(session.data.path(), first.path(first.data()));
        assert_ne!(session.head.path(), first.path(first.head()));
        let second = mgr.finish(session)?;

        assert!(!first.path(first.head()).exists(), "old head is stale");
        assert!(second.path(second.last()).exists());
        assert_eq!(second.last().txn, first.last().txn);
        Ok(())
    }

    #[test]
    fn test_large_last_file_is_replaced() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 100)?;
        let mut session = mgr.open_session(None, 0, 0)?;
        write_table(&mut session, &(0..64).collect::<Vec<_>>(), true)?;
        let first = mgr.finish(session)?;
        assert!(first.last().info.size >= 100);

        let session = mgr.open_session(Some(first.clone()), 0, 0)?;
        assert!(session.d_file_same && !session.l_file_same);
        mgr.finish(session)?;
        assert!(!first.path(first.last()).exists());
        Ok(())
    }

    #[test]
    fn test_revert_keeps_old_version() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let mut session = mgr.open_session(None, 0, 0)?;
        write_table(&mut session, &[1, 2], false)?;
        let first = mgr.finish(session)?;
        let data_len = fs::metadata(first.path(first.data()))?.len();

        let mut session = mgr.open_session(Some(first.clone()), 0, 0)?;
        write_table(&mut session, &[5, 6, 7], false)?;
        let head = session.head.path().to_path_buf();
        mgr.revert(session);

        assert!(!head.exists());
        assert_eq!(fs::metadata(first.path(first.data()))?.len(), data_len);
        assert_eq!(mgr.catalog().get(0)?, Some(first.clone()));
        let reader = FileSetReader::open(first)?;
        assert_eq!(reader.load_block_idx()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_install_reverts_and_replays_old_version() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let mut session = mgr.open_session(None, 0, 0)?;
        write_table(&mut session, &[1, 2], false)?;
        let first = mgr.finish(session)?;
        let data_len = fs::metadata(first.path(first.data()))?.len();

        let mut session = mgr.open_session(Some(first.clone()), 0, 0)?;
        write_table(&mut session, &[5, 6, 7], false)?;
        let head = session.head.path().to_path_buf();
        mgr.catalog().faults().sync.store(true, Ordering::SeqCst);
        assert!(mgr.finish(session).is_err());
        assert!(!head.exists());
        assert_eq!(fs::metadata(first.path(first.data()))?.len(), data_len);
        drop(mgr);

        let mgr = manager(root.path(), 32 * 1024)?;
        let set = mgr.catalog().get(0)?.ok_or_else(|| Error::NotFound("fid 0".into()))?;
        assert_eq!(set, first);
        let reader = FileSetReader::open(set)?;
        assert_eq!(reader.load_block_idx()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_poisoned_catalog_keeps_session_files() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let mut session = mgr.open_session(None, 0, 0)?;
        write_table(&mut session, &[1, 2], false)?;
        let head = session.head.path().to_path_buf();
        mgr.catalog().faults().sync.store(true, Ordering::SeqCst);
        mgr.catalog().faults().rollback.store(true, Ordering::SeqCst);

        assert!(mgr.finish(session).is_err());
        assert!(mgr.catalog().is_poisoned());
        assert!(head.exists());
        assert!(mgr.open_session(None, 1, 0).and_then(|s| mgr.finish(s)).is_err());
        Ok(())
    }

    #[test]
    fn test_relocate_and_remove() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let mut session = mgr.open_session(None, 4, 0)?;
        write_table(&mut session, &[40, 41], false)?;
        let hot = mgr.finish(session)?;

        let cold = mgr.relocate(&hot, 1)?.unwrap();
        assert_eq!(cold.level, 1);
        assert!(cold.dir.ends_with("t1"));
        assert!(!hot.path(hot.data()).exists());
        let reader = FileSetReader::open(cold.clone())?;
        assert_eq!(reader.load_block_idx()?.len(), 1);
        assert!(mgr.relocate(&cold, 1)?.is_none());

        mgr.remove(4)?;
        assert!(mgr.catalog().get(4)?.is_none());
        assert!(!cold.path(cold.data()).exists());
        Ok(())
    }

    #[test]
    fn test_remove_orphans() -> Result<()> {
        let root = TempDir::new()?;
        let mgr = manager(root.path(), 32 * 1024)?;
        let session = mgr.open_session(None, 0, 0)?;
        let set = mgr.finish(session)?;
        let orphan = root.path().join("t0").join("v0ver99.data");
        fs::write(&orphan, b"partial")?;
        fs::write(root.path().join("t0").join("notes.txt"), b"keep")?;

        assert_eq!(mgr.remove_orphans()?, 1);
        assert!(!orphan.exists());
        assert!(root.path().join("t0").join("notes.txt").exists());
        assert!(set.path(set.head()).exists());
        Ok(())
    }
}
