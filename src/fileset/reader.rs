use std::sync::Arc;

use super::file::{DataFile, FILE_HEADER_SIZE};
use super::index::{self, BlockIdx};
use super::FileSet;
use crate::block::aggregate;
use crate::block::reader::{decode_block, decode_keys, header_len_from_prefix};
use crate::block::{BlockEntry, BlockInfo, BlockMeta, ColumnAggregate, DataCols, BLOCK_PREFIX_SIZE};
use crate::error::{Error, Result};
use crate::row::Key;
use crate::schema::Schema;

/// Read access to one installed file-set version.
///
/// Every read is bounded by the extents recorded in the catalog, so a
/// reader stays valid while a newer version appends to the same files.
#[derive(Debug)]
pub struct FileSetReader {
    set: Arc<FileSet>,
    head: DataFile,
    data: DataFile,
    last: DataFile,
    sma: DataFile,
}

impl FileSetReader {
    pub fn open(set: Arc<FileSet>) -> Result<Self> {
        let open = |meta| DataFile::open_read(&set.dir, set.fid, meta);
        let head = open(set.head())?;
        let data = open(set.data())?;
        let last = open(set.last())?;
        let sma = open(set.sma())?;
        Ok(Self {
            set,
            head,
            data,
            last,
            sma,
        })
    }

    pub fn set(&self) -> &Arc<FileSet> {
        &self.set
    }

    pub fn load_block_idx(&self) -> Result<Vec<BlockIdx>> {
        index::read_index(&self.head)
    }

    pub fn load_block_info(&self, idx: &BlockIdx) -> Result<BlockInfo> {
        let info = index::read_block_info(&self.head, idx)?;
        if info.entries.len() != idx.num_blocks as usize {
            return Err(Error::Corrupted(format!(
                "table {} lists {} blocks, index says {}",
                idx.table,
                info.entries.len(),
                idx.num_blocks
            )));
        }
        Ok(info)
    }

    fn file_of(&self, meta: &BlockMeta) -> &DataFile {
        if meta.last {
            &self.last
        } else {
            &self.data
        }
    }

    /// Raw bytes of one physical block.
    pub fn load_raw(&self, meta: &BlockMeta) -> Result<Vec<u8>> {
        self.file_of(meta).read_at(meta.offset, meta.len as usize)
    }

    /// Key column of a logical block, without reading its value columns.
    pub fn load_keys(&self, entry: &BlockEntry) -> Result<Vec<Key>> {
        let mut keys: Vec<Key> = Vec::with_capacity(entry.meta().num_rows as usize);
        for meta in entry.physical() {
            let file = self.file_of(meta);
            let prefix = file.read_at(meta.offset, BLOCK_PREFIX_SIZE.min(meta.len as usize))?;
            let len = header_len_from_prefix(&prefix)? + meta.key_len as usize;
            if len > meta.len as usize {
                return Err(Error::Corrupted("block key section exceeds block".into()));
            }
            let part = decode_keys(&file.read_at(meta.offset, len)?, meta)?;
            keys.extend(part);
        }
        if entry.sub_block_count() > 1 {
            keys.sort_unstable();
            keys.dedup();
        }
        Ok(keys)
    }

    /// Fully decodes a logical block, applying sub-blocks oldest first.
    pub fn load_block(&self, entry: &BlockEntry, schema: &Schema) -> Result<DataCols> {
        let mut layers = entry.physical().iter();
        let Some(first) = layers.next() else {
            return Err(Error::Corrupted("layered block without sub-blocks".into()));
        };
        let mut cols = decode_block(&self.load_raw(first)?, first, schema)?;
        for meta in layers {
            let newer = decode_block(&self.load_raw(meta)?, meta, schema)?;
            cols = cols.overlay(&newer)?;
        }
        if cols.rows() != entry.meta().num_rows as usize {
            return Err(Error::Corrupted(format!(
                "block holds {} rows, directory says {}",
                cols.rows(),
                entry.meta().num_rows
            )));
        }
        Ok(cols)
    }

    pub fn load_aggregates(&self, meta: &BlockMeta) -> Result<Vec<ColumnAggregate>> {
        if !meta.has_aggregates() {
            return Ok(Vec::new());
        }
        if meta.aggr_offset < FILE_HEADER_SIZE {
            return Err(Error::Corrupted("aggregate record inside file header".into()));
        }
        aggregate::decode_record(&self.sma.read_at(meta.aggr_offset, meta.aggr_len as usize)?)
    }
}
