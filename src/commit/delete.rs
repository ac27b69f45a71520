//! Deletion Log Merge.
//!
//! Delete-range operations of the whole storage unit live in a single delete
//! file next to the catalog. Each commit writes a new version holding the
//! old items plus the newly buffered ones:
//!
//! ```text
//! +--------+--------------------------------------------+-------------------+
//! | header | blob per table:                            | index:            |
//! |        |   count u32 | (version, start, end)* | crc | count | entry* | crc |
//! +--------+--------------------------------------------+-------------------+
//! ```
//!
//! An index entry is `(suid, uid, min_key, max_key, min_version,
//! max_version, offset, len)`; entries are sorted by table.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use itertools::{EitherOrBoth, Itertools};
use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::error::{Error, Result};
use crate::fileset::catalog::Catalog;
use crate::fileset::{DataFile, FileKind, FileMeta};
use crate::hasher::CRC32;
use crate::row::{DeleteOp, Key, TableId, Version};

const DEL_ITEM_SIZE: usize = 24;
const DEL_IDX_SIZE: usize = 8 * 7 + 4;

/// Summary of one table's delete blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelIdx {
    pub table: TableId,
    pub min_key: Key,
    pub max_key: Key,
    pub min_version: Version,
    pub max_version: Version,
    pub offset: u64,
    pub len: u32,
}

impl DelIdx {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.table.suid)?;
        buf.write_u64::<BigEndian>(self.table.uid)?;
        buf.write_i64::<BigEndian>(self.min_key)?;
        buf.write_i64::<BigEndian>(self.max_key)?;
        buf.write_i64::<BigEndian>(self.min_version)?;
        buf.write_i64::<BigEndian>(self.max_version)?;
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
            min_key: cursor.read_i64::<BigEndian>()?,
            max_key: cursor.read_i64::<BigEndian>()?,
            min_version: cursor.read_i64::<BigEndian>()?,
            max_version: cursor.read_i64::<BigEndian>()?,
            offset: cursor.read_u64::<BigEndian>()?,
            len: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Splits a `[body][crc32]` region and verifies the checksum.
fn verified<'a>(buf: &'a [u8], context: &'static str) -> Result<&'a [u8]> {
    if buf.len() < 8 {
        return Err(Error::Corrupted(format!("{} too short", context)));
    }
    let (body, tail) = buf.split_at(buf.len() - 4);
    let expected = BigEndian::read_u32(tail);
    let actual = CRC32.checksum(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch {
            context,
            expected,
            actual,
        });
    }
    Ok(body)
}

fn sealed(mut buf: Vec<u8>) -> Result<Vec<u8>> {
    let checksum = CRC32.checksum(&buf);
    buf.write_u32::<BigEndian>(checksum)?;
    Ok(buf)
}

/// Read access to an installed delete file.
pub struct DelFileReader {
    file: DataFile,
}

impl DelFileReader {
    pub fn open(dir: &Path, meta: &FileMeta) -> Result<Self> {
        Ok(Self {
            file: DataFile::open_read(dir, 0, meta)?,
        })
    }

    pub fn load_index(&self) -> Result<Vec<DelIdx>> {
        let info = self.file.info();
        if info.len == 0 {
            return Ok(Vec::new());
        }
        let buf = self.file.read_at(info.offset, info.len as usize)?;
        let body = verified(&buf, "delete index")?;
        let mut cursor = Cursor::new(body);
        let count = cursor.read_u32::<BigEndian>()? as usize;
        if body.len() != 4 + count * DEL_IDX_SIZE {
            return Err(Error::Corrupted(format!(
                "delete index holds {} bytes for {} entries",
                body.len(),
                count
            )));
        }
        (0..count).map(|_| DelIdx::decode_from(&mut cursor)).collect()
    }

    pub fn load_items(&self, idx: &DelIdx) -> Result<Vec<DeleteOp>> {
        let buf = self.file.read_at(idx.offset, idx.len as usize)?;
        let body = verified(&buf, "delete blob")?;
        let mut cursor = Cursor::new(body);
        let count = cursor.read_u32::<BigEndian>()? as usize;
        if body.len() != 4 + count * DEL_ITEM_SIZE {
            return Err(Error::Corrupted(format!(
                "delete blob of table {} holds {} bytes for {} items",
                idx.table,
                body.len(),
                count
            )));
        }
        (0..count)
            .map(|_| {
                Ok(DeleteOp {
                    version: cursor.read_i64::<BigEndian>()?,
                    start_key: cursor.read_i64::<BigEndian>()?,
                    end_key: cursor.read_i64::<BigEndian>()?,
                })
            })
            .collect()
    }
}

/// Appends one table's blob and returns its index entry.
fn write_blob(file: &mut DataFile, table: TableId, items: &[DeleteOp]) -> Result<DelIdx> {
    let mut buf = Vec::with_capacity(4 + items.len() * DEL_ITEM_SIZE + 4);
    buf.write_u32::<BigEndian>(items.len() as u32)?;
    let mut idx = DelIdx {
        table,
        min_key: Key::MAX,
        max_key: Key::MIN,
        min_version: Version::MAX,
        max_version: Version::MIN,
        offset: 0,
        len: 0,
    };
    for op in items {
        buf.write_i64::<BigEndian>(op.version)?;
        buf.write_i64::<BigEndian>(op.start_key)?;
        buf.write_i64::<BigEndian>(op.end_key)?;
        idx.min_key = idx.min_key.min(op.start_key);
        idx.max_key = idx.max_key.max(op.end_key);
        idx.min_version = idx.min_version.min(op.version);
        idx.max_version = idx.max_version.max(op.version);
    }
    let buf = sealed(buf)?;
    file.fold_checksum(CRC32.checksum(&buf));
    idx.offset = file.append(&buf)?;
    idx.len = buf.len() as u32;
    file.info_mut().total_blocks += 1;
    file.info_mut().total_rows += items.len() as u64;
    Ok(idx)
}

fn write_index(file: &mut DataFile, idxs: &[DelIdx]) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + idxs.len() * DEL_IDX_SIZE + 4);
    buf.write_u32::<BigEndian>(idxs.len() as u32)?;
    for idx in idxs {
        idx.encode_into(&mut buf)?;
    }
    let buf = sealed(buf)?;
    let offset = file.append(&buf)?;
    let info = file.info_mut();
    info.offset = offset;
    info.len = buf.len() as u32;
    Ok(())
}

/// Writes a new delete file holding the installed items plus `ops`, which
/// must be sorted by table, and installs it.
///
/// Returns the installed file, or `None` when there was nothing to add.
pub fn commit_del(catalog: &Catalog, ops: &[(TableId, Vec<DeleteOp>)]) -> Result<Option<FileMeta>> {
    if ops.is_empty() {
        return Ok(None);
    }
    if ops.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(Error::InvalidOperation(
            "delete operations must be grouped and sorted by table".into(),
        ));
    }
    let dir = catalog.dir().to_path_buf();
    let old = catalog.del_file()?;
    let reader = old.as_ref().map(|meta| DelFileReader::open(&dir, meta)).transpose()?;
    let old_idxs = match &reader {
        Some(reader) => reader.load_index()?,
        None => Vec::new(),
    };

    let txn = catalog.next_txn()?;
    let mut file = DataFile::create(&dir, 0, txn, FileKind::Del)?;
    let written = (|| -> Result<usize> {
        let mut idxs = Vec::with_capacity(old_idxs.len() + ops.len());
        let joined = old_idxs
            .iter()
            .merge_join_by(ops.iter(), |idx, (table, _)| idx.table.cmp(table));
        for pair in joined {
            let (table, items) = match pair {
                EitherOrBoth::Left(idx) => (idx.table, load(&reader, idx)?),
                EitherOrBoth::Right((table, new)) => (*table, new.clone()),
                EitherOrBoth::Both(idx, (_, new)) => {
                    let mut items = load(&reader, idx)?;
                    items.extend_from_slice(new);
                    (idx.table, items)
                }
            };
            idxs.push(write_blob(&mut file, table, &items)?);
        }
        write_index(&mut file, &idxs)?;
        file.write_header()?;
        file.sync()?;
        Ok(idxs.len())
    })();

    let tables = match written {
        Ok(tables) => tables,
        Err(e) => {
            revert(file);
            return Err(e);
        }
    };
    let meta = file.meta();
    drop(file);
    if let Err(e) = catalog.install_del(meta) {
        if !catalog.is_poisoned() {
            if let Err(rm) = fs::remove_file(dir.join(meta.file_name(0))) {
                tracing::warn!(error = %rm, "failed to remove unused delete file");
            }
        }
        return Err(e);
    }
    drop(reader);

    if let Some(old) = old {
        let path = dir.join(old.file_name(0));
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove stale delete file");
        }
    }
    tracing::info!(txn = txn, tables = tables, "delete file installed");
    Ok(Some(meta))
}

fn load(reader: &Option<DelFileReader>, idx: &DelIdx) -> Result<Vec<DeleteOp>> {
    match reader {
        Some(reader) => reader.load_items(idx),
        None => Err(Error::InvalidState("delete index without a delete file".into())),
    }
}

fn revert(file: DataFile) {
    if let Err(e) = file.revert() {
        tracing::warn!(error = %e, "failed to remove unfinished delete file");
    }
}

/// Delete ranges recorded for `table` in the installed delete file.
pub fn delete_ranges(catalog: &Catalog, table: TableId) -> Result<Vec<DeleteOp>> {
    let Some(meta) = catalog.del_file()? else {
        return Ok(Vec::new());
    };
    let reader = DelFileReader::open(catalog.dir(), &meta)?;
    let idxs = reader.load_index()?;
    match idxs.binary_search_by(|idx| idx.table.cmp(&table)) {
        Ok(pos) => reader.load_items(&idxs[pos]),
        Err(_) => Ok(Vec::new()),
    }
}
