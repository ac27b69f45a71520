//! Block directory records.
//!
//! A table's blocks inside one file-set are described by a [`BlockInfo`]
//! record stored in the head file:
//!
//! ```text
//! +-----------+--------+--------+-----------+-----------+
//! | delimiter | suid   | uid    | n_entries | n_subs    |
//! |    u32    |  u64   |  u64   |    u32    |    u32    |
//! +-----------+--------+--------+-----------+-----------+
//! | entry metas (BlockMeta + sub_offset u32) ...       |
//! +-----------------------------------------------------+
//! | sub-block metas (BlockMeta) ...                    |
//! +-----------------------------------------------------+
//! | crc32 u32                                          |
//! +-----------------------------------------------------+
//! ```

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::compress::Compression;
use crate::error::{Error, Result};
use crate::hasher::CRC32;
use crate::row::{Key, TableId};

pub const BLOCK_INFO_DELIMITER: u32 = 0xF00A_FA0F;
pub const BLOCK_META_SIZE: usize = 60;

/// Location and summary of one physical block, or the logical summary of a
/// layered super-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Stored in the last file instead of the data file.
    pub last: bool,
    pub algorithm: Compression,
    /// 1 for a leaf, the layer count for a layered super-block, 0 for a sub-block.
    pub num_sub_blocks: u8,
    pub num_cols: u16,
    pub num_bsma: u16,
    pub offset: u64,
    pub len: u32,
    pub key_len: u32,
    pub num_rows: u32,
    pub min_key: Key,
    pub max_key: Key,
    pub aggr_offset: u64,
    pub aggr_len: u32,
    pub checksum: u32,
}

impl BlockMeta {
    pub fn has_aggregates(&self) -> bool {
        self.aggr_len > 0
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(self.last as u8)?;
        buf.write_u8(self.algorithm.to_u8())?;
        buf.write_u8(self.num_sub_blocks)?;
        buf.write_u8(0)?;
        buf.write_u16::<BigEndian>(self.num_cols)?;
        buf.write_u16::<BigEndian>(self.num_bsma)?;
        buf.write_u64::<BigEndian>(self.offset)?;
        buf.write_u32::<BigEndian>(self.len)?;
        buf.write_u32::<BigEndian>(self.key_len)?;
        buf.write_u32::<BigEndian>(self.num_rows)?;
        buf.write_i64::<BigEndian>(self.min_key)?;
        buf.write_i64::<BigEndian>(self.max_key)?;
        buf.write_u64::<BigEndian>(self.aggr_offset)?;
        buf.write_u32::<BigEndian>(self.aggr_len)?;
        buf.write_u32::<BigEndian>(self.checksum)?;
        Ok(())
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let last = cursor.read_u8()? != 0;
        let algorithm = Compression::from_u8(cursor.read_u8()?)
            .ok_or_else(|| Error::Corrupted("unknown compression id in block meta".into()))?;
        let num_sub_blocks = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        Ok(Self {
            last,
            algorithm,
            num_sub_blocks,
            num_cols: cursor.read_u16::<BigEndian>()?,
            num_bsma: cursor.read_u16::<BigEndian>()?,
            offset: cursor.read_u64::<BigEndian>()?,
            len: cursor.read_u32::<BigEndian>()?,
            key_len: cursor.read_u32::<BigEndian>()?,
            num_rows: cursor.read_u32::<BigEndian>()?,
            min_key: cursor.read_i64::<BigEndian>()?,
            max_key: cursor.read_i64::<BigEndian>()?,
            aggr_offset: cursor.read_u64::<BigEndian>()?,
            aggr_len: cursor.read_u32::<BigEndian>()?,
            checksum: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Directory entry of one logical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEntry {
    /// A single physical block.
    Leaf(BlockMeta),
    /// A super-block whose content is its sub-blocks layered oldest first.
    Layered(BlockMeta, Vec<BlockMeta>),
}

impl BlockEntry {
    /// Logical summary: key range, row count and file of the block.
    pub fn meta(&self) -> &BlockMeta {
        match self {
            BlockEntry::Leaf(meta) | BlockEntry::Layered(meta, _) => meta,
        }
    }

    pub fn is_last(&self) -> bool {
        self.meta().last
    }

    pub fn sub_block_count(&self) -> usize {
        match self {
            BlockEntry::Leaf(_) => 1,
            BlockEntry::Layered(_, subs) => subs.len(),
        }
    }

    /// Physical blocks in layering order.
    pub fn physical(&self) -> &[BlockMeta] {
        match self {
            BlockEntry::Leaf(meta) => std::slice::from_ref(meta),
            BlockEntry::Layered(_, subs) => subs,
        }
    }
}

/// All block entries of one table in one file-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub table: TableId,
    pub entries: Vec<BlockEntry>,
}

impl BlockInfo {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            entries: Vec::new(),
        }
    }

    pub fn has_last(&self) -> bool {
        self.entries.last().map_or(false, BlockEntry::is_last)
    }

    pub fn max_key(&self) -> Option<Key> {
        self.entries.last().map(|e| e.meta().max_key)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let subs: usize = self
            .entries
            .iter()
            .map(|e| match e {
                BlockEntry::Leaf(_) => 0,
                BlockEntry::Layered(_, subs) => subs.len(),
            })
            .sum();
        buf.try_reserve(32 + (self.entries.len() + subs) * (BLOCK_META_SIZE + 4))?;

        let start = buf.len();
        buf.write_u32::<BigEndian>(BLOCK_INFO_DELIMITER)?;
        buf.write_u64::<BigEndian>(self.table.suid)?;
        buf.write_u64::<BigEndian>(self.table.uid)?;
        buf.write_u32::<BigEndian>(self.entries.len() as u32)?;
        buf.write_u32::<BigEndian>(subs as u32)?;

        let mut sub_offset = 0u32;
        for entry in &self.entries {
            let mut meta = *entry.meta();
            meta.num_sub_blocks = match entry {
                BlockEntry::Leaf(_) => 1,
                BlockEntry::Layered(_, subs) => subs.len() as u8,
            };
            meta.encode_into(buf)?;
            buf.write_u32::<BigEndian>(sub_offset)?;
            if let BlockEntry::Layered(_, subs) = entry {
                sub_offset += subs.len() as u32;
            }
        }
        for entry in &self.entries {
            if let BlockEntry::Layered(_, subs) = entry {
                for sub in subs {
                    let mut sub = *sub;
                    sub.num_sub_blocks = 0;
                    sub.encode_into(buf)?;
                }
            }
        }

        let checksum = CRC32.checksum(&buf[start..]);
        buf.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    pub fn decode(buf: &[u8], table: TableId) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::Corrupted(format!("block info of {} too short", table)));
        }
        let (body, tail) = buf.split_at(buf.len() - 4);
        let expected = BigEndian::read_u32(tail);
        let actual = CRC32.checksum(body);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                context: "block info",
                expected,
                actual,
            });
        }

        let mut cursor = Cursor::new(body);
        if cursor.read_u32::<BigEndian>()? != BLOCK_INFO_DELIMITER {
            return Err(Error::Corrupted("block info delimiter".into()));
        }
        let found = TableId {
            suid: cursor.read_u64::<BigEndian>()?,
            uid: cursor.read_u64::<BigEndian>()?,
        };
        if found != table {
            return Err(Error::Corrupted(format!(
                "block info belongs to {}, expected {}",
                found, table
            )));
        }

        let n_entries = cursor.read_u32::<BigEndian>()? as usize;
        let n_subs = cursor.read_u32::<BigEndian>()? as usize;
        let mut supers = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            let meta = BlockMeta::decode_from(&mut cursor)?;
            let sub_offset = cursor.read_u32::<BigEndian>()? as usize;
            supers.push((meta, sub_offset));
        }
        let mut subs = Vec::with_capacity(n_subs);
        for _ in 0..n_subs {
            subs.push(BlockMeta::decode_from(&mut cursor)?);
        }

        let mut entries = Vec::with_capacity(n_entries);
        for (meta, sub_offset) in supers {
            if meta.num_sub_blocks <= 1 {
                entries.push(BlockEntry::Leaf(meta));
                continue;
            }
            let end = sub_offset + meta.num_sub_blocks as usize;
            let layers = subs
                .get(sub_offset..end)
                .ok_or_else(|| Error::Corrupted("sub-block range out of bounds".into()))?;
            entries.push(BlockEntry::Layered(meta, layers.to_vec()));
        }

        Ok(Self { table, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn meta(min_key: Key, max_key: Key, rows: u32, last: bool) -> BlockMeta {
        BlockMeta {
            last,
            algorithm: Compression::Lz4,
            num_sub_blocks: 1,
            num_cols: 2,
            num_bsma: 1,
            offset: 64 + min_key as u64,
            len: 100,
            key_len: 20,
            num_rows: rows,
            min_key,
            max_key,
            aggr_offset: 64,
            aggr_len: 41,
            checksum: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_entry_helpers() {
        let leaf = BlockEntry::Leaf(meta(1, 5, 5, false));
        assert_eq!(leaf.sub_block_count(), 1);
        assert_eq!(leaf.physical().len(), 1);

        let layered = BlockEntry::Layered(
            meta(1, 9, 7, true),
            vec![meta(1, 5, 5, true), meta(6, 9, 2, true)],
        );
        assert_eq!(layered.sub_block_count(), 2);
        assert!(layered.is_last());
        assert_eq!(layered.physical()[1].min_key, 6);
    }

    #[test]
    fn test_block_info_roundtrip_with_layers() -> Result<()> {
        let table = TableId::child(3, 4);
        let mut info = BlockInfo::new(table);
        info.entries.push(BlockEntry::Leaf(meta(1, 10, 10, false)));
        let mut sub0 = meta(11, 20, 10, false);
        sub0.num_sub_blocks = 0;
        let mut sub1 = meta(12, 25, 2, false);
        sub1.num_sub_blocks = 0;
        let mut sup = meta(11, 25, 11, false);
        sup.num_sub_blocks = 2;
        info.entries.push(BlockEntry::Layered(sup, vec![sub0, sub1]));
        info.entries.push(BlockEntry::Leaf(meta(30, 31, 2, true)));

        let mut buf = vec![0xAB];
        info.encode_into(&mut buf)?;
        let decoded = BlockInfo::decode(&buf[1..], table)?;
        assert_eq!(decoded, info);
        assert!(decoded.has_last());
        assert_eq!(decoded.max_key(), Some(31));
        Ok(())
    }

    #[test]
    fn test_block_info_rejects_damage_and_wrong_table() -> Result<()> {
        let table = TableId::normal(1);
        let mut info = BlockInfo::new(table);
        info.entries.push(BlockEntry::Leaf(meta(1, 2, 2, false)));
        let mut buf = Vec::new();
        info.encode_into(&mut buf)?;

        assert!(matches!(
            BlockInfo::decode(&buf, TableId::normal(2)),
            Err(Error::Corrupted(_))
        ));
        buf[30] ^= 0x01;
        assert!(BlockInfo::decode(&buf, table).unwrap_err().is_corruption());
        Ok(())
    }
}
