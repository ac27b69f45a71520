//! Commit Orchestrator.
//!
//! A commit drains one frozen memtable into the file-sets in phases:
//!
//! ```text
//! Idle -> Started -> DataCommitted -> DelCommitted -> Ended
//! ```
//!
//! Every partition is installed on its own, so a commit that fails midway
//! leaves a mix of new and old partition versions, each of them complete.
//! The frozen snapshot survives the failure and remembers which partitions
//! made it, and the next commit resumes from there.

use itertools::{EitherOrBoth, Itertools};
use std::sync::Arc;

use super::delete;
use super::retention::{self, Retention, RetentionAction};
use super::table::PartitionWriter;
use crate::config::CommitConfig;
use crate::error::{Error, Result};
use crate::fileset::{fid_of, key_range, Fid, FileSet, FileSetManager};
use crate::memtable::{FrozenMemtable, Memtable};
use crate::row::Key;
use crate::schema::SchemaSource;
use crate::state::UnitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Started,
    DataCommitted,
    DelCommitted,
    Ended { success: bool },
}

/// Totals of one commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub partitions: usize,
    pub skipped: usize,
    pub expired: usize,
    pub relocated: usize,
    pub tables: usize,
    pub blocks_written: usize,
    pub blocks_moved: usize,
    pub sub_blocks: usize,
    pub rows_written: usize,
    pub delete_tables: usize,
}

pub struct Committer<'a> {
    cfg: &'a CommitConfig,
    schemas: &'a dyn SchemaSource,
    mgr: &'a FileSetManager,
    state: &'a UnitState,
    retention: Retention,
    phase: CommitPhase,
    frozen: Option<Arc<FrozenMemtable>>,
    stats: CommitStats,
}

impl<'a> Committer<'a> {
    pub fn new(
        cfg: &'a CommitConfig,
        schemas: &'a dyn SchemaSource,
        mgr: &'a FileSetManager,
        state: &'a UnitState,
        now: Key,
    ) -> Self {
        Self {
            cfg,
            schemas,
            mgr,
            state,
            retention: Retention::snapshot(cfg.retention, cfg.partition_width, now),
            phase: CommitPhase::Idle,
            frozen: None,
            stats: CommitStats::default(),
        }
    }

    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    pub fn stats(&self) -> CommitStats {
        self.stats
    }

    fn expect_phase(&self, phase: CommitPhase) -> Result<()> {
        if self.phase != phase {
            return Err(Error::InvalidState(format!(
                "commit is {:?}, expected {:?}",
                self.phase, phase
            )));
        }
        Ok(())
    }

    fn frozen(&self) -> Result<Arc<FrozenMemtable>> {
        self.frozen
            .clone()
            .ok_or_else(|| Error::InvalidState("commit has no frozen snapshot".into()))
    }

    /// Freezes the active memtable. An empty snapshot ends the commit.
    pub fn start(&mut self) -> Result<()> {
        self.expect_phase(CommitPhase::Idle)?;
        let frozen = self.state.freeze()?;
        self.begin(frozen)
    }

    /// Picks up the snapshot a failed commit left behind.
    pub fn resume(&mut self, frozen: Arc<FrozenMemtable>) -> Result<()> {
        self.expect_phase(CommitPhase::Idle)?;
        tracing::info!(generation = frozen.generation(), "resuming commit");
        self.begin(frozen)
    }

    fn begin(&mut self, frozen: Arc<FrozenMemtable>) -> Result<()> {
        let empty = frozen.is_empty();
        let generation = frozen.generation();
        self.frozen = Some(frozen);
        self.phase = CommitPhase::Started;
        if empty {
            tracing::debug!(generation = generation, "nothing to commit");
            self.end(Ok(()))?;
        }
        Ok(())
    }

    /// Runs the remaining phases and ends the commit.
    pub fn run(mut self) -> Result<CommitStats> {
        if let CommitPhase::Ended { .. } = self.phase {
            return Ok(self.stats);
        }
        let result = self.commit_data().and_then(|_| self.commit_del());
        self.end(result)
    }

    /// Walks installed partitions together with the partitions that have
    /// buffered rows, in fid order.
    pub fn commit_data(&mut self) -> Result<()> {
        self.expect_phase(CommitPhase::Started)?;
        let frozen = self.frozen()?;
        let mem = frozen.memtable();
        let width = self.cfg.partition_width;

        let mut sets = self.mgr.catalog().filesets()?.into_iter().peekable();
        let mut from = match self.retention.min_fid {
            Fid::MIN => Some(Key::MIN),
            min_fid => Some(key_range(min_fid, width).0),
        };
        loop {
            let next_mem = match from.and_then(|k| mem.next_key_from(k)) {
                Some(key) => Some(fid_of(key, width)?),
                None => None,
            };
            let next_set = sets.peek().map(|s| s.fid);
            let fid = match (next_set, next_mem) {
                (None, None) => break,
                (Some(a), Some(b)) => a.min(b),
                (Some(fid), None) | (None, Some(fid)) => fid,
            };
            let set = if next_set == Some(fid) { sets.next() } else { None };
            let has_mem = next_mem == Some(fid);
            if has_mem {
                from = key_range(fid, width).1.checked_add(1);
            }

            if self.retention.is_expired(fid) {
                if set.is_some() {
                    self.mgr.remove(fid)?;
                    self.stats.expired += 1;
                    tracing::info!(fid = fid, "expired file-set removed");
                }
                continue;
            }
            if !has_mem {
                if let Some(set) = set {
                    self.apply_retention(&set)?;
                }
                continue;
            }
            if frozen.is_committed(fid)? {
                tracing::debug!(fid = fid, "partition committed by an earlier attempt");
                self.stats.skipped += 1;
                continue;
            }
            self.commit_partition(fid, set, mem)?;
            frozen.mark_committed(fid)?;
        }
        self.phase = CommitPhase::DataCommitted;
        Ok(())
    }

    fn apply_retention(&mut self, set: &Arc<FileSet>) -> Result<()> {
        match retention::apply(self.mgr, &self.retention, set)? {
            RetentionAction::Kept => {}
            RetentionAction::Expired => self.stats.expired += 1,
            RetentionAction::Relocated { .. } => self.stats.relocated += 1,
        }
        Ok(())
    }

    fn commit_partition(&mut self, fid: Fid, set: Option<Arc<FileSet>>, mem: &Memtable) -> Result<()> {
        let level = self
            .retention
            .level_of(fid)
            .ok_or_else(|| Error::InvalidState(format!("partition {} is expired", fid)))?;
        let range = key_range(fid, self.cfg.partition_width);
        let session = self.mgr.open_session(set, fid, level)?;
        let mut writer = PartitionWriter::new(self.cfg, self.schemas, session, range);

        if let Err(e) = merge_tables(&mut writer, mem) {
            tracing::warn!(fid = fid, error = %e, "partition merge failed");
            self.mgr.revert(writer.into_session());
            return Err(e);
        }
        let part = writer.stats();
        self.mgr.finish(writer.into_session())?;

        self.stats.partitions += 1;
        self.stats.tables += part.tables;
        self.stats.blocks_written += part.blocks_written;
        self.stats.blocks_moved += part.blocks_moved;
        self.stats.sub_blocks += part.sub_blocks;
        self.stats.rows_written += part.rows_written;
        Ok(())
    }

    /// Merges the buffered delete ranges into the delete file.
    pub fn commit_del(&mut self) -> Result<()> {
        self.expect_phase(CommitPhase::DataCommitted)?;
        let frozen = self.frozen()?;
        if !frozen.deletes_committed() {
            let ops = frozen.memtable().delete_ops()?;
            delete::commit_del(self.mgr.catalog(), &ops)?;
            self.stats.delete_tables = ops.len();
            frozen.mark_deletes_committed();
        }
        self.phase = CommitPhase::DelCommitted;
        Ok(())
    }

    /// Releases the snapshot on success; on failure keeps it for a retry.
    pub fn end(&mut self, result: Result<()>) -> Result<CommitStats> {
        let frozen = self.frozen()?;
        match result {
            Ok(()) => {
                self.state.release_frozen(frozen.generation())?;
                self.phase = CommitPhase::Ended { success: true };
                tracing::info!(
                    generation = frozen.generation(),
                    partitions = self.stats.partitions,
                    rows = self.stats.rows_written,
                    expired = self.stats.expired,
                    relocated = self.stats.relocated,
                    "commit finished"
                );
                Ok(self.stats)
            }
            Err(e) => {
                self.phase = CommitPhase::Ended { success: false };
                tracing::warn!(
                    generation = frozen.generation(),
                    error = %e,
                    "commit failed, snapshot kept for retry"
                );
                Err(e)
            }
        }
    }
}

/// Runs the Table Merge Engine over every table of a partition: tables with
/// buffered rows are merge-joined with the old block index by table id.
fn merge_tables(writer: &mut PartitionWriter<'_>, mem: &Memtable) -> Result<()> {
    let old = writer.old_index()?;
    let tables = mem.table_ids();
    for pair in old.iter().merge_join_by(tables, |idx, table| idx.table.cmp(table)) {
        match pair {
            EitherOrBoth::Left(idx) => writer.move_blk_idx(idx)?,
            EitherOrBoth::Right(table) => writer.commit_table(table, None, mem.cursor(table))?,
            EitherOrBoth::Both(idx, table) => {
                writer.commit_table(table, Some(idx), mem.cursor(table))?
            }
        }
    }
    Ok(())
}
