use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;

use super::bitmap::BitmapMode;
use super::cols::{self, DataCols};
use super::compress;
use super::meta::BlockMeta;
use super::{header_len, BLOCK_DELIMITER, BLOCK_FLAG_SUPER, BLOCK_PREFIX_SIZE};
use crate::error::{Error, Result};
use crate::hasher::CRC32;
use crate::row::{Cell, Key, TableId};
use crate::schema::{ColumnId, ColumnType, Schema};

/// Parsed block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub table: TableId,
    pub num_rows: usize,
    pub is_super: bool,
    pub cols: Vec<ColumnDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub id: ColumnId,
    pub ty: ColumnType,
    pub mode: BitmapMode,
    pub offset: u32,
    pub len: u32,
    pub blen: u32,
}

impl BlockHeader {
    pub fn encoded_len(&self) -> usize {
        header_len(self.cols.len())
    }
}

fn verify(context: &'static str, body: &[u8], stored: &[u8]) -> Result<()> {
    let expected = BigEndian::read_u32(stored);
    let actual = CRC32.checksum(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Number of header bytes given the fixed block prefix.
pub fn header_len_from_prefix(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < BLOCK_PREFIX_SIZE {
        return Err(Error::Corrupted("block prefix too short".into()));
    }
    let num_cols = BigEndian::read_u16(&prefix[BLOCK_PREFIX_SIZE - 2..BLOCK_PREFIX_SIZE]);
    Ok(header_len(num_cols as usize))
}

pub fn decode_header(buf: &[u8]) -> Result<BlockHeader> {
    let len = header_len_from_prefix(buf)?;
    if buf.len() < len {
        return Err(Error::Corrupted("block header truncated".into()));
    }
    verify("block header", &buf[..len - 4], &buf[len - 4..len])?;

    let mut cursor = Cursor::new(&buf[..len - 4]);
    if cursor.read_u32::<BigEndian>()? != BLOCK_DELIMITER {
        return Err(Error::Corrupted("block delimiter".into()));
    }
    let table = TableId {
        suid: cursor.read_u64::<BigEndian>()?,
        uid: cursor.read_u64::<BigEndian>()?,
    };
    let num_rows = cursor.read_u32::<BigEndian>()? as usize;
    let flags = cursor.read_u8()?;
    let num_cols = cursor.read_u16::<BigEndian>()? as usize;
    let mut cols = Vec::with_capacity(num_cols);
    for _ in 0..num_cols {
        let id = cursor.read_u16::<BigEndian>()?;
        let ty = ColumnType::from_u8(cursor.read_u8()?)
            .ok_or_else(|| Error::Corrupted("unknown column type in block".into()))?;
        let mode = BitmapMode::from_u8(cursor.read_u8()?)
            .ok_or_else(|| Error::Corrupted("unknown bitmap mode in block".into()))?;
        cols.push(ColumnDesc {
            id,
            ty,
            mode,
            offset: cursor.read_u32::<BigEndian>()?,
            len: cursor.read_u32::<BigEndian>()?,
            blen: cursor.read_u32::<BigEndian>()?,
        });
    }
    Ok(BlockHeader {
        table,
        num_rows,
        is_super: flags & BLOCK_FLAG_SUPER != 0,
        cols,
    })
}

/// Decodes the key stream from a buffer holding at least the header and the
/// key section of a block.
pub fn decode_keys(buf: &[u8], meta: &BlockMeta) -> Result<Vec<Key>> {
    let header = decode_header(buf)?;
    let start = header.encoded_len();
    let end = start + meta.key_len as usize;
    if buf.len() < end || meta.key_len < 4 {
        return Err(Error::Corrupted("block key section truncated".into()));
    }
    verify("block keys", &buf[start..end - 4], &buf[end - 4..end])?;

    let raw = compress::decompress(&buf[start..end - 4], meta.algorithm)?;
    if raw.len() != header.num_rows * 8 {
        return Err(Error::Corrupted(format!(
            "key stream holds {} bytes for {} rows",
            raw.len(),
            header.num_rows
        )));
    }
    Ok(raw.chunks_exact(8).map(BigEndian::read_i64).collect())
}

/// Decodes a whole block into the column layout of `schema`.
///
/// Columns absent from the block come back as nulls for super-blocks and
/// as unsupplied cells for sub-blocks; block columns unknown to `schema`
/// are skipped.
pub fn decode_block(buf: &[u8], meta: &BlockMeta, schema: &Schema) -> Result<DataCols> {
    if buf.len() != meta.len as usize {
        return Err(Error::Corrupted(format!(
            "block holds {} bytes, expected {}",
            buf.len(),
            meta.len
        )));
    }
    let actual = CRC32.checksum(buf);
    if actual != meta.checksum {
        return Err(Error::ChecksumMismatch {
            context: "block",
            expected: meta.checksum,
            actual,
        });
    }

    let header = decode_header(buf)?;
    let keys = decode_keys(buf, meta)?;
    let area = &buf[header.encoded_len() + meta.key_len as usize..];
    let rows = header.num_rows;
    let missing = if header.is_super { Cell::Null } else { Cell::None };

    let mut out = DataCols::new(schema);
    out.keys = keys;
    for col in &mut out.cols {
        let Some(desc) = header.cols.iter().find(|d| d.id == col.id) else {
            col.cells = vec![missing.clone(); rows];
            continue;
        };
        if desc.ty != col.ty {
            col.cells = vec![Cell::Null; rows];
            continue;
        }

        let start = desc.offset as usize;
        let end = start + desc.len as usize;
        if area.len() < end || (desc.len as usize) < desc.blen as usize + 4 {
            return Err(Error::Corrupted(format!("column {} out of bounds", desc.id)));
        }
        let section = &area[start..end];
        let (payload, crc) = section.split_at(section.len() - 4);
        verify("block column", payload, crc)?;

        let (values, bits) = payload.split_at(payload.len() - desc.blen as usize);
        let values = compress::decompress(values, meta.algorithm)?;
        let bits = compress::decompress(bits, meta.algorithm)?;
        col.cells = cols::decode_values(&values, &bits, desc.mode, desc.ty, rows)?;
    }
    Ok(out)
}
