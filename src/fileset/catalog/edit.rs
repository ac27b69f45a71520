use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::fileset::{Fid, FileInfo, FileKind, FileMeta, FileSet};

const INSTALL_FILE_SET: u8 = 0x01;
const REMOVE_FILE_SET: u8 = 0x02;
const INSTALL_DEL_FILE: u8 = 0x03;
const SNAPSHOT: u8 = 0x04;

/// One atomic change to the set of installed files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEdit {
    /// Replaces whatever file-set was installed for `set.fid`.
    InstallFileSet { seq: u64, next_txn: u64, set: FileSet },

    RemoveFileSet { seq: u64, fid: Fid },

    InstallDelFile { seq: u64, next_txn: u64, file: FileMeta },

    /// Full state; replay discards everything before it.
    Snapshot {
        seq: u64,
        next_txn: u64,
        sets: Vec<FileSet>,
        del: Option<FileMeta>,
    },
}

impl CatalogEdit {
    pub fn seq(&self) -> u64 {
        match self {
            CatalogEdit::InstallFileSet { seq, .. }
            | CatalogEdit::RemoveFileSet { seq, .. }
            | CatalogEdit::InstallDelFile { seq, .. }
            | CatalogEdit::Snapshot { seq, .. } => *seq,
        }
    }

    pub fn next_txn(&self) -> Option<u64> {
        match self {
            CatalogEdit::InstallFileSet { next_txn, .. }
            | CatalogEdit::InstallDelFile { next_txn, .. }
            | CatalogEdit::Snapshot { next_txn, .. } => Some(*next_txn),
            CatalogEdit::RemoveFileSet { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            CatalogEdit::InstallFileSet { seq, next_txn, set } => {
                buf.write_u8(INSTALL_FILE_SET)?;
                buf.write_u64::<BigEndian>(*seq)?;
                buf.write_u64::<BigEndian>(*next_txn)?;
                set.encode_into(&mut buf)?;
            }
            CatalogEdit::RemoveFileSet { seq, fid } => {
                buf.write_u8(REMOVE_FILE_SET)?;
                buf.write_u64::<BigEndian>(*seq)?;
                buf.write_i32::<BigEndian>(*fid)?;
            }
            CatalogEdit::InstallDelFile {
                seq,
                next_txn,
                file,
            } => {
                buf.write_u8(INSTALL_DEL_FILE)?;
                buf.write_u64::<BigEndian>(*seq)?;
                buf.write_u64::<BigEndian>(*next_txn)?;
                encode_del(file, &mut buf)?;
            }
            CatalogEdit::Snapshot {
                seq,
                next_txn,
                sets,
                del,
            } => {
                buf.write_u8(SNAPSHOT)?;
                buf.write_u64::<BigEndian>(*seq)?;
                buf.write_u64::<BigEndian>(*next_txn)?;
                buf.write_u32::<BigEndian>(sets.len() as u32)?;
                for set in sets {
                    set.encode_into(&mut buf)?;
                }
                match del {
                    Some(file) => {
                        buf.write_u8(1)?;
                        encode_del(file, &mut buf)?;
                    }
                    None => buf.write_u8(0)?,
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let tag = cursor.read_u8()?;
        let seq = cursor.read_u64::<BigEndian>()?;
        let edit = match tag {
            INSTALL_FILE_SET => CatalogEdit::InstallFileSet {
                seq,
                next_txn: cursor.read_u64::<BigEndian>()?,
                set: FileSet::decode_from(&mut cursor)?,
            },
            REMOVE_FILE_SET => CatalogEdit::RemoveFileSet {
                seq,
                fid: cursor.read_i32::<BigEndian>()?,
            },
            INSTALL_DEL_FILE => CatalogEdit::InstallDelFile {
                seq,
                next_txn: cursor.read_u64::<BigEndian>()?,
                file: decode_del(&mut cursor)?,
            },
            SNAPSHOT => {
                let next_txn = cursor.read_u64::<BigEndian>()?;
                let count = cursor.read_u32::<BigEndian>()? as usize;
                let mut sets = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    sets.push(FileSet::decode_from(&mut cursor)?);
                }
                let del = match cursor.read_u8()? {
                    0 => None,
                    _ => Some(decode_del(&mut cursor)?),
                };
                CatalogEdit::Snapshot {
                    seq,
                    next_txn,
                    sets,
                    del,
                }
            }
            other => {
                return Err(Error::Corrupted(format!("unknown catalog edit {:#04x}", other)));
            }
        };
        if cursor.position() as usize != buf.len() {
            return Err(Error::Corrupted("trailing bytes in catalog edit".into()));
        }
        Ok(edit)
    }
}

fn encode_del(file: &FileMeta, buf: &mut Vec<u8>) -> Result<()> {
    buf.write_u64::<BigEndian>(file.txn)?;
    file.info.encode_into(buf)
}

fn decode_del(cursor: &mut Cursor<&[u8]>) -> Result<FileMeta> {
    Ok(FileMeta {
        kind: FileKind::Del,
        txn: cursor.read_u64::<BigEndian>()?,
        info: FileInfo::decode_from(cursor)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::tests::sample;

    fn del(txn: u64) -> FileMeta {
        FileMeta {
            kind: FileKind::Del,
            txn,
            info: FileInfo::default(),
        }
    }

    #[test]
    fn test_edit_encoding() -> Result<()> {
        let edits = vec![
            CatalogEdit::InstallFileSet {
                seq: 1,
                next_txn: 4,
                set: sample(2, 3),
            },
            CatalogEdit::RemoveFileSet { seq: 2, fid: -3 },
            CatalogEdit::InstallDelFile {
                seq: 3,
                next_txn: 5,
                file: del(4),
            },
            CatalogEdit::Snapshot {
                seq: 4,
                next_txn: 9,
                sets: vec![sample(1, 1), sample(2, 8)],
                del: Some(del(4)),
            },
            CatalogEdit::Snapshot {
                seq: 5,
                next_txn: 9,
                sets: Vec::new(),
                del: None,
            },
        ];
        for edit in edits {
            assert_eq!(CatalogEdit::decode(&edit.encode()?)?, edit);
        }
        Ok(())
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = vec![0x7F];
        buf.extend_from_slice(&1u64.to_be_bytes());
        assert!(matches!(CatalogEdit::decode(&buf), Err(Error::Corrupted(_))));
    }
}
