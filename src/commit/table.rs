//! Table Merge Engine.
//!
//! Merges the buffered rows of one table into the blocks the table already
//! has in a partition, in a single forward pass over both. Blocks that
//! buffered rows do not touch are moved; touched blocks either get a delta
//! sub-block appended or are rewritten.

use std::sync::Arc;

use super::merge::{load_and_merge, load_data_from_cache, MemRows, MergeInfo};
use crate::block::{BlockEntry, BlockInfo, BlockMeta, BlockWriter, DataCols};
use crate::config::CommitConfig;
use crate::error::{Error, Result};
use crate::fileset::index::{self, BlockIdx};
use crate::fileset::{FileSetReader, WriteSession};
use crate::memtable::TableCursor;
use crate::row::{Key, TableId};
use crate::schema::{Schema, SchemaSource};

/// Counters of one partition commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    pub tables: usize,
    pub blocks_written: usize,
    pub blocks_moved: usize,
    pub blocks_dropped: usize,
    pub sub_blocks: usize,
    pub rows_written: usize,
}

/// Output of one table while it is being merged.
struct TableOut {
    table: TableId,
    info: BlockInfo,
    schema: Option<Arc<Schema>>,
}

/// Writes the new version of one partition, table by table.
///
/// Tables must be committed in `(suid, uid)` order.
pub struct PartitionWriter<'a> {
    cfg: &'a CommitConfig,
    schemas: &'a dyn SchemaSource,
    session: WriteSession,
    writer: BlockWriter,
    range: (Key, Key),
    stats: PartitionStats,
}

impl<'a> PartitionWriter<'a> {
    pub fn new(
        cfg: &'a CommitConfig,
        schemas: &'a dyn SchemaSource,
        session: WriteSession,
        range: (Key, Key),
    ) -> Self {
        Self {
            cfg,
            schemas,
            session,
            writer: BlockWriter::new(cfg.compression),
            range,
            stats: PartitionStats::default(),
        }
    }

    pub fn stats(&self) -> PartitionStats {
        self.stats
    }

    pub fn into_session(self) -> WriteSession {
        self.session
    }

    /// Block index of the version being replaced.
    pub fn old_index(&self) -> Result<Vec<BlockIdx>> {
        match &self.session.old {
            Some(reader) => reader.load_block_idx(),
            None => Ok(Vec::new()),
        }
    }

    /// Carries a table that has no buffered rows over to the new version.
    pub fn move_blk_idx(&mut self, idx: &BlockIdx) -> Result<()> {
        self.commit_table(idx.table, Some(idx), None)
    }

    /// Merges the buffered rows of `table` with its blocks in the old version
    /// of the partition, described by `old`.
    pub fn commit_table(
        &mut self,
        table: TableId,
        old: Option<&BlockIdx>,
        cursor: Option<TableCursor>,
    ) -> Result<()> {
        let blocks = match old {
            Some(idx) => self.reader()?.load_block_info(idx)?.entries,
            None => Vec::new(),
        };
        let mut mem = match cursor.filter(|c| self.in_range(c)) {
            Some(cursor) => {
                let schema = self.schemas.resolve(table, None)?;
                Some(MemRows::new(
                    cursor,
                    table,
                    self.range,
                    self.cfg.update,
                    schema,
                    self.schemas,
                ))
            }
            None => None,
        };
        let mut out = TableOut {
            table,
            info: BlockInfo::new(table),
            schema: mem.as_ref().map(|m| m.schema().clone()),
        };

        let mut bidx = 0;
        loop {
            let pending = mem.as_mut().and_then(|m| m.peek_key().map(|k| (k, m)));
            match (blocks.get(bidx), pending) {
                (None, None) => break,
                (Some(entry), None) => {
                    self.move_block(&mut out, entry)?;
                    bidx += 1;
                }
                (Some(entry), Some((key, _))) if !entry.is_last() && entry.meta().max_key < key => {
                    self.move_block(&mut out, entry)?;
                    bidx += 1;
                }
                (Some(entry), Some((key, mem))) if entry.is_last() || key >= entry.meta().min_key => {
                    let limit = if entry.is_last() {
                        blocks
                            .get(bidx + 1)
                            .map_or(self.range.1, |next| next.meta().min_key.saturating_sub(1))
                    } else {
                        entry.meta().max_key
                    };
                    let is_final = bidx + 1 == blocks.len();
                    self.merge_mem_data(&mut out, mem, entry, limit, is_final)?;
                    bidx += 1;
                }
                (Some(entry), Some((_, mem))) => {
                    let limit = entry.meta().min_key.saturating_sub(1);
                    self.commit_mem_data(&mut out, mem, limit, true)?;
                }
                (None, Some((_, mem))) => {
                    let end = self.range.1;
                    self.commit_mem_data(&mut out, mem, end, false)?;
                }
            }
        }

        tracing::debug!(
            table = %table,
            blocks_before = blocks.len(),
            blocks_after = out.info.entries.len(),
            "table merged"
        );
        if let Some(idx) = index::write_block_info(&mut self.session.head, &out.info)? {
            self.session.idxs.push(idx);
        }
        self.stats.tables += 1;
        Ok(())
    }

    fn in_range(&self, cursor: &TableCursor) -> bool {
        let mut ahead = cursor.clone();
        ahead.seek(self.range.0);
        ahead.peek_key().map_or(false, |k| k <= self.range.1)
    }

    fn reader(&self) -> Result<&FileSetReader> {
        self.session.old.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("partition {} has blocks but no old version", self.session.fid))
        })
    }

    fn table_schema(&self, out: &mut TableOut) -> Result<Arc<Schema>> {
        if let Some(schema) = &out.schema {
            return Ok(schema.clone());
        }
        let schema = self.schemas.resolve(out.table, None)?;
        out.schema = Some(schema.clone());
        Ok(schema)
    }

    fn file_same(&self, entry: &BlockEntry) -> bool {
        if entry.is_last() {
            self.session.l_file_same
        } else {
            self.session.d_file_same
        }
    }

    /// Carries a block over unchanged.
    ///
    /// A block whose file is reused keeps its directory entry; otherwise it
    /// is decoded and written again as a single leaf.
    fn move_block(&mut self, out: &mut TableOut, entry: &BlockEntry) -> Result<()> {
        self.stats.blocks_moved += 1;
        if self.file_same(entry) {
            out.info.entries.push(entry.clone());
            return Ok(());
        }
        let schema = self.table_schema(out)?;
        let cols = self.reader()?.load_block(entry, &schema)?;
        self.write_block(out, &cols, entry.is_last())
    }

    fn merge_mem_data(
        &mut self,
        out: &mut TableOut,
        mem: &mut MemRows<'_>,
        entry: &BlockEntry,
        limit: Key,
        is_final: bool,
    ) -> Result<()> {
        let keys = self.reader()?.load_keys(entry)?;
        let mut dry = mem.clone();
        let info = load_data_from_cache(&mut dry, limit, &keys, usize::MAX, None)?;

        if info.n_operations == 0 {
            *mem = dry;
            return self.move_block(out, entry);
        }
        let merged = info.merged_rows(entry.meta().num_rows as usize);
        if merged == 0 {
            tracing::debug!(
                table = %out.table,
                min_key = entry.meta().min_key,
                "block emptied by deletes"
            );
            *mem = dry;
            self.stats.blocks_dropped += 1;
            return Ok(());
        }

        if self.can_add_sub_block(entry, &info, merged) {
            let mut delta = DataCols::new(mem.schema());
            load_data_from_cache(mem, limit, &keys, usize::MAX, Some(&mut delta))?;
            self.write_sub_block(out, entry, &delta, &info, merged)
        } else {
            let schema = mem.schema().clone();
            let disk = self.reader()?.load_block(entry, &schema)?;
            let mut cols = DataCols::new(&schema);
            load_and_merge(&disk, mem, limit, &mut cols)?;
            let may_go_last = is_final && mem.peek_key().is_none();
            self.write_chunks(out, &cols, may_go_last)
        }
    }

    fn can_add_sub_block(&self, entry: &BlockEntry, info: &MergeInfo, merged: usize) -> bool {
        if entry.sub_block_count() >= self.cfg.max_sub_blocks
            || info.n_operations > self.cfg.max_rows
            || info.rows_delete_succeed > 0
        {
            return false;
        }
        if entry.is_last() {
            self.session.l_file_same && merged < self.cfg.min_rows
        } else {
            self.session.d_file_same && merged <= self.cfg.max_rows
        }
    }

    /// Appends `delta` to the block's own file and layers it over the block.
    fn write_sub_block(
        &mut self,
        out: &mut TableOut,
        entry: &BlockEntry,
        delta: &DataCols,
        info: &MergeInfo,
        merged: usize,
    ) -> Result<()> {
        let last = entry.is_last();
        let dst = if last {
            &mut self.session.last
        } else {
            &mut self.session.data
        };
        let sub = self
            .writer
            .write(out.table, delta, dst, &mut self.session.sma, false, last)?;

        let mut subs: Vec<BlockMeta> = entry.physical().to_vec();
        subs.push(sub);
        let mut top = *entry.meta();
        top.min_key = info.key_first;
        top.max_key = info.key_last;
        top.num_rows = merged as u32;
        top.num_sub_blocks = subs.len() as u8;
        top.num_bsma = 0;
        top.aggr_offset = 0;
        top.aggr_len = 0;

        tracing::debug!(
            table = %out.table,
            sub_blocks = subs.len(),
            rows = merged,
            "sub-block appended"
        );
        out.info.entries.push(BlockEntry::Layered(top, subs));
        self.stats.sub_blocks += 1;
        self.stats.rows_written += delta.rows();
        Ok(())
    }

    /// Writes merged rows in blocks of at most `max_rows`. Only the final
    /// chunk may go to the last file, and only when `may_go_last`.
    fn write_chunks(&mut self, out: &mut TableOut, cols: &DataCols, may_go_last: bool) -> Result<()> {
        let rows = cols.rows();
        let mut start = 0;
        while start < rows {
            let end = (start + self.cfg.max_rows).min(rows);
            let chunk = cols.extract(start..end);
            let last = may_go_last && end == rows && chunk.rows() < self.cfg.min_rows;
            self.write_block(out, &chunk, last)?;
            start = end;
        }
        Ok(())
    }

    /// Writes buffered rows up to `limit` as new blocks. With `to_data` every
    /// block goes to the data file, otherwise a short tail goes to last.
    fn commit_mem_data(
        &mut self,
        out: &mut TableOut,
        mem: &mut MemRows<'_>,
        limit: Key,
        to_data: bool,
    ) -> Result<()> {
        let schema = mem.schema().clone();
        loop {
            let mut cols = DataCols::new(&schema);
            load_data_from_cache(mem, limit, &[], self.cfg.max_rows, Some(&mut cols))?;
            if cols.is_empty() {
                return Ok(());
            }
            let last = !to_data && cols.rows() < self.cfg.min_rows;
            self.write_block(out, &cols, last)?;
        }
    }

    fn write_block(&mut self, out: &mut TableOut, cols: &DataCols, last: bool) -> Result<()> {
        let dst = if last {
            &mut self.session.last
        } else {
            &mut self.session.data
        };
        let meta = self
            .writer
            .write(out.table, cols, dst, &mut self.session.sma, true, last)?;
        out.info.entries.push(BlockEntry::Leaf(meta));
        self.stats.blocks_written += 1;
        self.stats.rows_written += cols.rows();
        Ok(())
    }
}
