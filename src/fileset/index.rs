//! Block Index Writer.
//!
//! The head file of a file-set holds one [`BlockInfo`] record per table and,
//! at its end, the block index: one [`BlockIdx`] per table pointing at that
//! record.
//!
//! ```text
//! +-------+----------------------------------------------------------+-------+
//! | count | (suid, uid, has_last, max_key, num_blocks, offset, len)* | crc32 |
//! | u32   | 41 bytes each                                            | u32   |
//! +-------+----------------------------------------------------------+-------+
//! ```
//!
//! Entries are sorted by `(suid, uid)`. The head file header records the
//! region's `offset` and `len`; an empty index is recorded as `0`/`0`.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::file::DataFile;
use crate::block::BlockInfo;
use crate::error::{Error, Result};
use crate::hasher::CRC32;
use crate::row::{Key, TableId};

const BLOCK_IDX_SIZE: usize = 8 + 8 + 1 + 8 + 4 + 8 + 4;

/// Index entry locating one table's [`BlockInfo`] in the head file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIdx {
    pub table: TableId,
    pub has_last: bool,
    pub max_key: Key,
    pub num_blocks: u32,
    pub offset: u64,
    pub len: u32,
}

impl BlockIdx {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.table.suid)?;
        buf.write_u64::<BigEndian>(self.table.uid)?;
        buf.write_u8(self.has_last as u8)?;
        buf.write_i64::<BigEndian>(self.max_key)?;
        buf.write_u32::<BigEndian>(self.num_blocks)?;
        buf.write_u64::<BigEndian>(self.offset)?;
        buf.write_u32::<BigEndian>(self.len)?;
        Ok(())
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            table: TableId {
                suid: cursor.read_u64::<BigEndian>()?,
                uid: cursor.read_u64::<BigEndian>()?,
            },
            has_last: cursor.read_u8()? != 0,
            max_key: cursor.read_i64::<BigEndian>()?,
            num_blocks: cursor.read_u32::<BigEndian>()?,
            offset: cursor.read_u64::<BigEndian>()?,
            len: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Appends a table's block directory to the head file and returns its index
/// entry. Tables without blocks produce no entry.
pub fn write_block_info(head: &mut DataFile, info: &BlockInfo) -> Result<Option<BlockIdx>> {
    let Some(max_key) = info.max_key() else {
        return Ok(None);
    };
    let mut buf = Vec::new();
    info.encode_into(&mut buf)?;
    let offset = head.append(&buf)?;
    Ok(Some(BlockIdx {
        table: info.table,
        has_last: info.has_last(),
        max_key,
        num_blocks: info.entries.len() as u32,
        offset,
        len: buf.len() as u32,
    }))
}

pub fn read_block_info(head: &DataFile, idx: &BlockIdx) -> Result<BlockInfo> {
    let buf = head.read_at(idx.offset, idx.len as usize)?;
    BlockInfo::decode(&buf, idx.table)
}

/// Writes the index region and records its location in the head file info.
pub fn write_index(head: &mut DataFile, idxs: &[BlockIdx]) -> Result<()> {
    if idxs.is_empty() {
        let info = head.info_mut();
        info.offset = 0;
        info.len = 0;
        return Ok(());
    }
    if idxs.windows(2).any(|w| w[0].table >= w[1].table) {
        return Err(Error::InvalidOperation(
            "block index entries must be sorted by table".into(),
        ));
    }

    let mut buf = Vec::with_capacity(4 + idxs.len() * BLOCK_IDX_SIZE + 4);
    buf.write_u32::<BigEndian>(idxs.len() as u32)?;
    for idx in idxs {
        idx.encode_into(&mut buf)?;
    }
    let checksum = CRC32.checksum(&buf);
    buf.write_u32::<BigEndian>(checksum)?;

    let offset = head.append(&buf)?;
    let info = head.info_mut();
    info.offset = offset;
    info.len = buf.len() as u32;
    Ok(())
}

/// Loads and verifies the index region of a head file.
pub fn read_index(head: &DataFile) -> Result<Vec<BlockIdx>> {
    let info = head.info();
    if info.len == 0 {
        return Ok(Vec::new());
    }
    let buf = head.read_at(info.offset, info.len as usize)?;
    if buf.len() < 8 {
        return Err(Error::Corrupted("block index too short".into()));
    }
    let (body, tail) = buf.split_at(buf.len() - 4);
    let expected = BigEndian::read_u32(tail);
    let actual = CRC32.checksum(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch {
            context: "block index",
            expected,
            actual,
        });
    }

    let mut cursor = Cursor::new(body);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    if body.len() != 4 + count * BLOCK_IDX_SIZE {
        return Err(Error::Corrupted(format!(
            "block index holds {} bytes for {} entries",
            body.len(),
            count
        )));
    }
    (0..count).map(|_| BlockIdx::decode_from(&mut cursor)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockEntry, BlockMeta, Compression};
    use crate::fileset::FileKind;
    use tempfile::TempDir;

    fn leaf(min_key: Key, max_key: Key, last: bool) -> BlockEntry {
        BlockEntry::Leaf(BlockMeta {
            last,
            algorithm: Compression::None,
            num_sub_blocks: 1,
            num_cols: 1,
            num_bsma: 0,
            offset: 64,
            len: 10,
            key_len: 8,
            num_rows: (max_key - min_key + 1) as u32,
            min_key,
            max_key,
            aggr_offset: 0,
            aggr_len: 0,
            checksum: 1,
        })
    }

    #[test]
    fn test_index_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let mut head = DataFile::create(dir.path(), 0, 1, FileKind::Head)?;

        let mut idxs = Vec::new();
        for (uid, last) in [(1u64, false), (2, true)] {
            let mut info = BlockInfo::new(TableId::normal(uid));
            info.entries.push(leaf(0, 9, false));
            info.entries.push(leaf(10, 12, last));
            idxs.extend(write_block_info(&mut head, &info)?);
        }
        assert!(write_block_info(&mut head, &BlockInfo::new(TableId::normal(3)))?.is_none());
        write_index(&mut head, &idxs)?;

        let loaded = read_index(&head)?;
        assert_eq!(loaded, idxs);
        assert!(loaded[1].has_last && !loaded[0].has_last);
        assert_eq!(loaded[0].max_key, 12);
        assert_eq!(loaded[0].num_blocks, 2);

        let info = read_block_info(&head, &loaded[1])?;
        assert_eq!(info.table, TableId::normal(2));
        assert_eq!(info.entries.len(), 2);
        Ok(())
    }

    #[test]
    fn test_empty_index() -> Result<()> {
        let dir = TempDir::new()?;
        let mut head = DataFile::create(dir.path(), 0, 1, FileKind::Head)?;
        write_index(&mut head, &[])?;
        assert_eq!((head.info().offset, head.info().len), (0, 0));
        assert!(read_index(&head)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_unsorted_index_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let mut head = DataFile::create(dir.path(), 0, 1, FileKind::Head)?;
        let idx = |uid| BlockIdx {
            table: TableId::normal(uid),
            has_last: false,
            max_key: 0,
            num_blocks: 1,
            offset: 64,
            len: 1,
        };
        assert!(write_index(&mut head, &[idx(2), idx(1)]).is_err());
        Ok(())
    }

    #[test]
    fn test_damaged_index() -> Result<()> {
        let dir = TempDir::new()?;
        let mut head = DataFile::create(dir.path(), 0, 1, FileKind::Head)?;
        let mut info = BlockInfo::new(TableId::normal(1));
        info.entries.push(leaf(0, 1, false));
        let idx = write_block_info(&mut head, &info)?.unwrap();
        write_index(&mut head, &[idx])?;

        let mut broken = *head.info();
        broken.len -= 1;
        *head.info_mut() = broken;
        assert!(read_index(&head).unwrap_err().is_corruption());
        Ok(())
    }
}
