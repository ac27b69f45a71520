//! Physical files of a file-set.
//!
//! Every file starts with a fixed 64-byte header describing how much of the
//! file is valid:
//!
//! ```text
//! +--------+------+-----+-----+-----+------+--------+-----+--------+--------+-------+
//! | magic  | kind | fid | txn | tag | size | offset | len | blocks | rows   | crc32 |
//! | 8      | 1    | 4   | 8   | 4   | 8    | 8      | 4   | 4      | 8      | 4     |
//! +--------+------+-----+-----+-----+------+--------+-----+--------+--------+-------+
//! ```
//!
//! `offset`/`len` locate the index region of head files. The catalog keeps a
//! copy of the same [`FileInfo`], and that copy is authoritative: bytes past
//! the recorded `size` belong to an unfinished commit and are discarded when
//! the file is reopened for appending.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::hasher::{Hasher, CRC32, INITIAL_TAG};

/// Partition id of a file-set.
pub type Fid = i32;

pub const FILE_HEADER_SIZE: u64 = 64;
const FILE_MAGIC: &[u8; 8] = b"TSFSET\0\x01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FileKind {
    Head = 0,
    Data = 1,
    Last = 2,
    Sma = 3,
    /// Delete file of the storage unit, not part of any file-set.
    Del = 4,
}

impl FileKind {
    /// The four files of a file-set, in on-disk order.
    pub const SET: [FileKind; 4] = [FileKind::Head, FileKind::Data, FileKind::Last, FileKind::Sma];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FileKind::Head),
            1 => Some(FileKind::Data),
            2 => Some(FileKind::Last),
            3 => Some(FileKind::Sma),
            4 => Some(FileKind::Del),
            _ => None,
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            FileKind::Head => "head",
            FileKind::Data => "data",
            FileKind::Last => "last",
            FileKind::Sma => "sma",
            FileKind::Del => "del",
        }
    }
}

/// Length-tracking state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Running integrity tag over the checksums of all appended blocks.
    pub magic: u32,
    pub size: u64,
    pub offset: u64,
    pub len: u32,
    pub total_blocks: u32,
    pub total_rows: u64,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            magic: INITIAL_TAG,
            size: FILE_HEADER_SIZE,
            offset: 0,
            len: 0,
            total_blocks: 0,
            total_rows: 0,
        }
    }
}

impl FileInfo {
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<BigEndian>(self.magic)?;
        buf.write_u64::<BigEndian>(self.size)?;
        buf.write_u64::<BigEndian>(self.offset)?;
        buf.write_u32::<BigEndian>(self.len)?;
        buf.write_u32::<BigEndian>(self.total_blocks)?;
        buf.write_u64::<BigEndian>(self.total_rows)?;
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            magic: cursor.read_u32::<BigEndian>()?,
            size: cursor.read_u64::<BigEndian>()?,
            offset: cursor.read_u64::<BigEndian>()?,
            len: cursor.read_u32::<BigEndian>()?,
            total_blocks: cursor.read_u32::<BigEndian>()?,
            total_rows: cursor.read_u64::<BigEndian>()?,
        })
    }
}

/// Catalog record of one file: its kind, the commit that named it and its
/// valid extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub kind: FileKind,
    pub txn: u64,
    pub info: FileInfo,
}

impl FileMeta {
    pub fn file_name(&self, fid: Fid) -> String {
        file_name(fid, self.txn, self.kind)
    }
}

pub fn file_name(fid: Fid, txn: u64, kind: FileKind) -> String {
    match kind {
        FileKind::Del => format!("ver{}.{}", txn, kind.ext()),
        _ => format!("v{}ver{}.{}", fid, txn, kind.ext()),
    }
}

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: FileKind,
    pub fid: Fid,
    pub txn: u64,
    pub info: FileInfo,
}

impl FileHeader {
    pub fn encode(&self) -> Result<[u8; FILE_HEADER_SIZE as usize]> {
        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE as usize);
        buf.extend_from_slice(FILE_MAGIC);
        buf.write_u8(self.kind as u8)?;
        buf.write_i32::<BigEndian>(self.fid)?;
        buf.write_u64::<BigEndian>(self.txn)?;
        self.info.encode_into(&mut buf)?;
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;

        let mut out = [0u8; FILE_HEADER_SIZE as usize];
        out[..buf.len()].copy_from_slice(&buf);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        const BODY: usize = 8 + 1 + 4 + 8 + 36;
        if buf.len() < BODY + 4 {
            return Err(Error::Corrupted("file header too short".into()));
        }
        if &buf[..8] != FILE_MAGIC {
            return Err(Error::Corrupted("invalid file magic".into()));
        }
        let expected = BigEndian::read_u32(&buf[BODY..BODY + 4]);
        let actual = CRC32.checksum(&buf[..BODY]);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                context: "file header",
                expected,
                actual,
            });
        }

        let mut cursor = Cursor::new(&buf[8..BODY]);
        let kind = FileKind::from_u8(cursor.read_u8()?)
            .ok_or_else(|| Error::Corrupted("unknown file kind".into()))?;
        Ok(Self {
            kind,
            fid: cursor.read_i32::<BigEndian>()?,
            txn: cursor.read_u64::<BigEndian>()?,
            info: FileInfo::decode_from(&mut cursor)?,
        })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        file.read_exact(&mut buf)?;
        Self::decode(&buf)
    }
}

/// An open file of a file-set.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    fid: Fid,
    kind: FileKind,
    txn: u64,
    info: FileInfo,
    /// Extent at open time, restored on revert.
    original: FileInfo,
    hasher: Hasher,
    created: bool,
    file: File,
}

impl DataFile {
    /// Creates a fresh file with an empty header.
    pub fn create(dir: &Path, fid: Fid, txn: u64, kind: FileKind) -> Result<Self> {
        let path = dir.join(file_name(fid, txn, kind));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let info = FileInfo::default();
        let mut this = Self {
            path,
            fid,
            kind,
            txn,
            info,
            original: info,
            hasher: Hasher::new(),
            created: true,
            file,
        };
        if let Err(e) = this.write_header() {
            let _ = fs::remove_file(&this.path);
            return Err(e);
        }
        Ok(this)
    }

    /// Opens an installed file for appending after its recorded extent.
    pub fn open_append(dir: &Path, fid: Fid, meta: &FileMeta) -> Result<Self> {
        let path = dir.join(meta.file_name(fid));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        // Bytes past the recorded size come from an unfinished commit.
        if file.metadata()?.len() != meta.info.size {
            file.set_len(meta.info.size)?;
        }
        Ok(Self {
            path,
            fid,
            kind: meta.kind,
            txn: meta.txn,
            info: meta.info,
            original: meta.info,
            hasher: Hasher::resume(meta.info.magic),
            created: false,
            file,
        })
    }

    pub fn open_read(dir: &Path, fid: Fid, meta: &FileMeta) -> Result<Self> {
        let path = dir.join(meta.file_name(fid));
        let file = File::open(&path)?;
        if file.metadata()?.len() < meta.info.size {
            return Err(Error::Corrupted(format!(
                "{} is shorter than its recorded size {}",
                path.display(),
                meta.info.size
            )));
        }
        Ok(Self {
            path,
            fid,
            kind: meta.kind,
            txn: meta.txn,
            info: meta.info,
            original: meta.info,
            hasher: Hasher::resume(meta.info.magic),
            created: false,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut FileInfo {
        &mut self.info
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn meta(&self) -> FileMeta {
        FileMeta {
            kind: self.kind,
            txn: self.txn,
            info: self.info,
        }
    }

    /// Appends `bytes` at the end of the valid extent, returning their offset.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.info.size;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        self.info.size += bytes.len() as u64;
        Ok(offset)
    }

    /// Folds a block checksum into the running integrity tag.
    pub fn fold_checksum(&mut self, checksum: u32) {
        self.hasher.write(&checksum.to_be_bytes());
        self.info.magic = self.hasher.tag();
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset < FILE_HEADER_SIZE || offset + len as u64 > self.info.size {
            return Err(Error::Corrupted(format!(
                "range {}+{} outside {} (size {})",
                offset,
                len,
                self.path.display(),
                self.info.size
            )));
        }
        let mut buf = vec![0u8; len];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_header(&mut self) -> Result<()> {
        let header = FileHeader {
            kind: self.kind,
            fid: self.fid,
            txn: self.txn,
            info: self.info,
        }
        .encode()?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Undoes everything written through this handle.
    ///
    /// Created files are removed; reused files are cut back to their extent
    /// at open time and get their previous header back.
    pub fn revert(mut self) -> Result<()> {
        if self.created {
            let path = self.path.clone();
            drop(self);
            fs::remove_file(path)?;
            return Ok(());
        }
        self.info = self.original;
        self.file.set_len(self.original.size)?;
        self.write_header()?;
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_append_and_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let mut file = DataFile::create(dir.path(), 3, 7, FileKind::Data)?;
        assert_eq!(file.size(), FILE_HEADER_SIZE);

        let offset = file.append(b"block-bytes")?;
        assert_eq!(offset, FILE_HEADER_SIZE);
        file.fold_checksum(42);
        file.info_mut().total_blocks += 1;
        file.write_header()?;
        file.sync()?;
        let meta = file.meta();
        drop(file);

        let header = FileHeader::read(dir.path().join("v3ver7.data"))?;
        assert_eq!(header.info, meta.info);
        assert_eq!(header.fid, 3);

        let reader = DataFile::open_read(dir.path(), 3, &meta)?;
        assert_eq!(reader.read_at(offset, 11)?, b"block-bytes");
        assert!(reader.read_at(offset, 12).is_err());
        Ok(())
    }

    #[test]
    fn test_open_append_discards_unrecorded_tail() -> Result<()> {
        let dir = TempDir::new()?;
        let mut file = DataFile::create(dir.path(), 0, 1, FileKind::Last)?;
        file.append(b"committed")?;
        file.write_header()?;
        let meta = file.meta();
        file.append(b"garbage-from-crash")?;
        drop(file);

        let mut reopened = DataFile::open_append(dir.path(), 0, &meta)?;
        let offset = reopened.append(b"next")?;
        assert_eq!(offset, meta.info.size);
        assert_eq!(
            fs::metadata(dir.path().join("v0ver1.last"))?.len(),
            meta.info.size + 4
        );
        Ok(())
    }

    #[test]
    fn test_revert_restores_or_removes() -> Result<()> {
        let dir = TempDir::new()?;
        let mut base = DataFile::create(dir.path(), 1, 1, FileKind::Data)?;
        base.append(b"old")?;
        base.write_header()?;
        let meta = base.meta();
        drop(base);

        let mut reused = DataFile::open_append(dir.path(), 1, &meta)?;
        reused.append(b"new block")?;
        reused.fold_checksum(9);
        reused.write_header()?;
        reused.revert()?;
        let header = FileHeader::read(dir.path().join("v1ver1.data"))?;
        assert_eq!(header.info, meta.info);
        assert_eq!(fs::metadata(dir.path().join("v1ver1.data"))?.len(), meta.info.size);

        let fresh = DataFile::create(dir.path(), 1, 2, FileKind::Head)?;
        let path = fresh.path().to_path_buf();
        fresh.revert()?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_header_detects_damage() -> Result<()> {
        let header = FileHeader {
            kind: FileKind::Sma,
            fid: -4,
            txn: 11,
            info: FileInfo::default(),
        };
        let mut buf = header.encode()?;
        assert_eq!(FileHeader::decode(&buf)?, header);
        buf[20] ^= 0x10;
        assert!(FileHeader::decode(&buf).unwrap_err().is_corruption());
        Ok(())
    }
}
