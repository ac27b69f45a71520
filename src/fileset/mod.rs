//! File-sets: the on-disk unit of one time partition.
//!
//! A partition `fid` covers the keys `[fid * width, (fid + 1) * width - 1]`
//! and is stored as four files:
//!
//! - `head`: per-table [`BlockInfo`](crate::block::BlockInfo) records followed
//!   by the block index region.
//! - `data`: full blocks.
//! - `last`: small tail blocks that later commits may merge into.
//! - `sma`: aggregate records of super-blocks.
//!
//! Which files make up the current version of a partition is decided only by
//! the [`Catalog`]; files are never renamed, and a new version of a file-set
//! either appends to reusable files or creates new ones.

pub mod catalog;
pub mod file;
pub mod index;
pub mod manager;
pub mod reader;
pub mod tiers;

pub use catalog::Catalog;
pub use file::{DataFile, Fid, FileHeader, FileInfo, FileKind, FileMeta, FILE_HEADER_SIZE};
pub use index::BlockIdx;
pub use manager::{FileSetManager, WriteSession};
pub use reader::FileSetReader;
pub use tiers::Tiers;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::row::Key;

/// Partition of `key` for the given partition width.
pub fn fid_of(key: Key, width: i64) -> Result<Fid> {
    Fid::try_from(key.div_euclid(width))
        .map_err(|_| Error::InvalidOperation(format!("key {} outside any partition", key)))
}

/// First and last key of partition `fid`.
pub fn key_range(fid: Fid, width: i64) -> (Key, Key) {
    let start = (fid as i64).saturating_mul(width);
    (start, start.saturating_add(width - 1))
}

/// An installed version of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    pub fid: Fid,
    /// Storage level the files live on.
    pub level: u8,
    pub disk_id: u32,
    pub dir: PathBuf,
    /// Head, data, last and sma, in that order.
    pub files: [FileMeta; 4],
}

impl FileSet {
    pub fn head(&self) -> &FileMeta {
        &self.files[0]
    }

    pub fn data(&self) -> &FileMeta {
        &self.files[1]
    }

    pub fn last(&self) -> &FileMeta {
        &self.files[2]
    }

    pub fn sma(&self) -> &FileMeta {
        &self.files[3]
    }

    pub fn path(&self, meta: &FileMeta) -> PathBuf {
        self.dir.join(meta.file_name(self.fid))
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|m| self.path(m)).collect()
    }

    pub fn total_rows(&self) -> u64 {
        self.data().info.total_rows + self.last().info.total_rows
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let dir = self
            .dir
            .to_str()
            .ok_or_else(|| Error::InvalidOperation(format!("non utf-8 path {}", self.dir.display())))?;
        buf.write_i32::<BigEndian>(self.fid)?;
        buf.write_u8(self.level)?;
        buf.write_u32::<BigEndian>(self.disk_id)?;
        buf.write_u32::<BigEndian>(dir.len() as u32)?;
        buf.extend_from_slice(dir.as_bytes());
        for meta in &self.files {
            buf.write_u8(meta.kind as u8)?;
            buf.write_u64::<BigEndian>(meta.txn)?;
            meta.info.encode_into(buf)?;
        }
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let fid = cursor.read_i32::<BigEndian>()?;
        let level = cursor.read_u8()?;
        let disk_id = cursor.read_u32::<BigEndian>()?;
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let mut dir = vec![0u8; len];
        cursor.read_exact(&mut dir)?;
        let dir = String::from_utf8(dir)
            .map_err(|_| Error::Corrupted("file-set directory is not utf-8".into()))?;

        let mut files = [FileMeta {
            kind: FileKind::Head,
            txn: 0,
            info: FileInfo::default(),
        }; 4];
        for (slot, expected) in files.iter_mut().zip(FileKind::SET) {
            let kind = FileKind::from_u8(cursor.read_u8()?)
                .filter(|k| *k == expected)
                .ok_or_else(|| Error::Corrupted(format!("file-set {} file order", fid)))?;
            *slot = FileMeta {
                kind,
                txn: cursor.read_u64::<BigEndian>()?,
                info: FileInfo::decode_from(cursor)?,
            };
        }
        Ok(Self {
            fid,
            level,
            disk_id,
            dir: PathBuf::from(dir),
            files,
        })
    }

    /// Whether `path` is one of this set's files.
    pub fn owns(&self, path: &Path) -> bool {
        self.files.iter().any(|m| self.path(m) == path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample(fid: Fid, txn: u64) -> FileSet {
        let mut files = FileKind::SET.map(|kind| FileMeta {
            kind,
            txn,
            info: FileInfo::default(),
        });
        files[1].info.size = 4096;
        files[1].info.total_rows = 120;
        FileSet {
            fid,
            level: 0,
            disk_id: 0,
            dir: PathBuf::from("/tmp/tsdb"),
            files,
        }
    }

    #[test]
    fn test_partition_math() -> Result<()> {
        let width = 10;
        assert_eq!(fid_of(0, width)?, 0);
        assert_eq!(fid_of(9, width)?, 0);
        assert_eq!(fid_of(10, width)?, 1);
        assert_eq!(fid_of(-1, width)?, -1);
        assert_eq!(key_range(-1, width), (-10, -1));
        assert_eq!(key_range(3, width), (30, 39));
        assert!(fid_of(i64::MAX, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_fileset_encoding() -> Result<()> {
        let set = sample(-7, 3);
        let mut buf = Vec::new();
        set.encode_into(&mut buf)?;
        let decoded = FileSet::decode_from(&mut Cursor::new(&buf[..]))?;
        assert_eq!(decoded, set);
        assert_eq!(decoded.total_rows(), 120);
        assert!(decoded.owns(&PathBuf::from("/tmp/tsdb/v-7ver3.data")));

        buf[4 + 1 + 4 + 4 + "/tmp/tsdb".len()] = FileKind::Sma as u8;
        assert!(FileSet::decode_from(&mut Cursor::new(&buf[..])).is_err());
        Ok(())
    }
}
