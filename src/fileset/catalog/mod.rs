//! Catalog of installed files.
//!
//! The catalog plays the role an LSM manifest plays for SSTables: it is an
//! append-only log of edits and the single source of truth for which
//! file-set is current for each partition and which delete file is live.
//! Files not named by the catalog are garbage, whatever their content.
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | CatalogEdit 1    |   [len u32][edit bytes][crc32 u32]
//! +------------------+
//! | CatalogEdit 2    |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Every edit is synced before the in-memory state changes, so an installed
//! file-set is durable once `install` returns. A record cut short by a crash
//! is dropped on open; a complete record that fails its checksum is
//! corruption. After `snapshot_interval` edits the log is rewritten as a
//! single snapshot edit.
//!
//! An append that fails is cut back off the log before the error is
//! returned, so the edit never resurfaces on replay. If the log cannot be
//! cut back the catalog is poisoned: it refuses further edits, and callers
//! must leave their files alone since either version may be the durable one.

pub mod edit;
pub mod header;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use edit::CatalogEdit;
use header::{CatalogHeader, HEADER_SIZE};

use super::{Fid, FileMeta, FileSet};
use crate::error::{Error, Result};
use crate::hasher::CRC32;

pub const CATALOG_FILE: &str = "CATALOG";
const CATALOG_TMP_FILE: &str = "CATALOG.tmp";

/// State rebuilt by replaying the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogState {
    pub sets: BTreeMap<Fid, Arc<FileSet>>,
    pub del: Option<FileMeta>,
    pub next_txn: u64,
}

impl CatalogState {
    fn apply(&mut self, edit: CatalogEdit) {
        if let Some(next_txn) = edit.next_txn() {
            self.next_txn = self.next_txn.max(next_txn);
        }
        match edit {
            CatalogEdit::InstallFileSet { set, .. } => {
                self.sets.insert(set.fid, Arc::new(set));
            }
            CatalogEdit::RemoveFileSet { fid, .. } => {
                self.sets.remove(&fid);
            }
            CatalogEdit::InstallDelFile { file, .. } => {
                self.del = Some(file);
            }
            CatalogEdit::Snapshot { sets, del, .. } => {
                self.sets = sets.into_iter().map(|s| (s.fid, Arc::new(s))).collect();
                self.del = del;
            }
        }
    }
}

pub struct Catalog {
    dir: PathBuf,
    writer: Mutex<BufWriter<File>>,
    header: RwLock<CatalogHeader>,
    state: RwLock<CatalogState>,
    edit_count: AtomicU32,
    poisoned: AtomicBool,
    #[cfg(test)]
    faults: Faults,
}

/// Failure switches for exercising the error paths of `append`.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Faults {
    /// Fails the next sync after the record reached the file.
    pub sync: AtomicBool,
    /// Fails the next rollback of a failed append.
    pub rollback: AtomicBool,
}

impl Catalog {
    /// Opens the catalog in `dir`, creating it if needed, and replays it.
    pub fn open(dir: impl Into<PathBuf>, snapshot_interval: u32) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(CATALOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut header = if file.metadata()?.len() == 0 {
            let header = CatalogHeader::new(snapshot_interval);
            file.write_all(&header.encode()?)?;
            file.sync_all()?;
            header
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact(&mut buf)?;
            CatalogHeader::decode(&buf)?
        };
        header.snapshot_interval = snapshot_interval;

        let mut state = CatalogState {
            next_txn: header.next_txn,
            ..CatalogState::default()
        };
        let mut edits = 0;
        let mut iter = CatalogIterator::new(file.try_clone()?)?;
        for edit in &mut iter {
            let edit = edit?;
            header.current_seq = header.current_seq.max(edit.seq());
            state.apply(edit);
            edits += 1;
        }
        let valid_end = iter.position;
        let len = file.metadata()?.len();
        if len > valid_end {
            tracing::warn!(
                path = %path.display(),
                dropped = len - valid_end,
                "ignoring torn catalog tail"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        header.next_txn = state.next_txn;

        file.seek(SeekFrom::End(0))?;
        tracing::info!(
            sets = state.sets.len(),
            edits = edits,
            next_txn = state.next_txn,
            "catalog replayed"
        );

        Ok(Self {
            dir,
            writer: Mutex::new(BufWriter::new(file)),
            header: RwLock::new(header),
            state: RwLock::new(state),
            edit_count: AtomicU32::new(edits),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            faults: Faults::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True once a failed edit could not be cut back off the log.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn faults(&self) -> &Faults {
        &self.faults
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(Error::InvalidState(
                "catalog is poisoned by a failed edit; reopen to recover".into(),
            ));
        }
        Ok(())
    }

    /// Reserves a transaction id for naming new files.
    ///
    /// The counter is persisted with the next edit; ids handed out by a
    /// commit that never installs anything may be reissued after a restart.
    pub fn next_txn(&self) -> Result<u64> {
        let mut state = self.state.write()?;
        let txn = state.next_txn;
        state.next_txn += 1;
        Ok(txn)
    }

    pub fn get(&self, fid: Fid) -> Result<Option<Arc<FileSet>>> {
        Ok(self.state.read()?.sets.get(&fid).cloned())
    }

    /// Installed file-sets ordered by fid.
    pub fn filesets(&self) -> Result<Vec<Arc<FileSet>>> {
        Ok(self.state.read()?.sets.values().cloned().collect())
    }

    pub fn del_file(&self) -> Result<Option<FileMeta>> {
        Ok(self.state.read()?.del)
    }

    pub fn state(&self) -> Result<CatalogState> {
        Ok(self.state.read()?.clone())
    }

    /// Durably installs `set`, returning the version it replaced.
    pub fn install(&self, set: FileSet) -> Result<Option<Arc<FileSet>>> {
        let fid = set.fid;
        let mut writer = self.writer.lock()?;
        let next_txn = self.state.read()?.next_txn;
        let seq = self.next_seq()?;
        self.append(
            &mut writer,
            &CatalogEdit::InstallFileSet {
                seq,
                next_txn,
                set: set.clone(),
            },
        )?;
        let old = self.state.write()?.sets.insert(fid, Arc::new(set));
        self.maybe_snapshot(&mut writer)?;
        Ok(old)
    }

    pub fn remove(&self, fid: Fid) -> Result<Option<Arc<FileSet>>> {
        let mut writer = self.writer.lock()?;
        if !self.state.read()?.sets.contains_key(&fid) {
            return Ok(None);
        }
        let seq = self.next_seq()?;
        self.append(&mut writer, &CatalogEdit::RemoveFileSet { seq, fid })?;
        let old = self.state.write()?.sets.remove(&fid);
        self.maybe_snapshot(&mut writer)?;
        Ok(old)
    }

    pub fn install_del(&self, file: FileMeta) -> Result<Option<FileMeta>> {
        let mut writer = self.writer.lock()?;
        let next_txn = self.state.read()?.next_txn;
        let seq = self.next_seq()?;
        self.append(
            &mut writer,
            &CatalogEdit::InstallDelFile {
                seq,
                next_txn,
                file,
            },
        )?;
        let old = self.state.write()?.del.replace(file);
        self.maybe_snapshot(&mut writer)?;
        Ok(old)
    }

    /// Rewrites the log as a single snapshot edit.
    pub fn snapshot(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        self.rewrite(&mut writer)
    }

    fn next_seq(&self) -> Result<u64> {
        let mut header = self.header.write()?;
        header.current_seq += 1;
        Ok(header.current_seq)
    }

    fn append(&self, writer: &mut BufWriter<File>, edit: &CatalogEdit) -> Result<()> {
        self.check_poisoned()?;
        let bytes = edit.encode()?;
        let start = writer.stream_position()?;
        if let Err(e) = self.write_record(writer, &bytes) {
            match self.rollback(writer, start) {
                Ok(()) => tracing::warn!(error = %e, offset = start, "catalog edit rolled back"),
                Err(rollback) => {
                    self.poisoned.store(true, Ordering::SeqCst);
                    tracing::error!(
                        error = %e,
                        rollback_error = %rollback,
                        offset = start,
                        "catalog edit could not be rolled back, catalog poisoned"
                    );
                }
            }
            return Err(e);
        }
        self.edit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_record(&self, writer: &mut BufWriter<File>, bytes: &[u8]) -> Result<()> {
        writer.write_u32::<BigEndian>(bytes.len() as u32)?;
        writer.write_all(bytes)?;
        writer.write_u32::<BigEndian>(CRC32.checksum(bytes))?;
        writer.flush()?;
        #[cfg(test)]
        if self.faults.sync.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure").into());
        }
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Cuts the log back to `start`, discarding anything still buffered.
    fn rollback(&self, writer: &mut BufWriter<File>, start: u64) -> Result<()> {
        #[cfg(test)]
        if self.faults.rollback.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected truncate failure").into());
        }
        let file = writer.get_ref().try_clone()?;
        let (_, _unflushed) = std::mem::replace(writer, BufWriter::new(file)).into_parts();
        let file = writer.get_mut();
        file.set_len(start)?;
        file.sync_data()?;
        file.seek(SeekFrom::Start(start))?;
        Ok(())
    }

    fn maybe_snapshot(&self, writer: &mut BufWriter<File>) -> Result<()> {
        let interval = self.header.read()?.snapshot_interval;
        if interval == 0 || self.edit_count.load(Ordering::SeqCst) < interval {
            return Ok(());
        }
        // The edit above is already durable.
        if let Err(e) = self.rewrite(writer) {
            tracing::warn!(error = %e, "catalog snapshot failed");
        }
        Ok(())
    }

    fn rewrite(&self, writer: &mut BufWriter<File>) -> Result<()> {
        self.check_poisoned()?;
        let (edit, header) = {
            let state = self.state.read()?;
            let mut header = self.header.write()?;
            header.current_seq += 1;
            header.next_txn = state.next_txn;
            let edit = CatalogEdit::Snapshot {
                seq: header.current_seq,
                next_txn: state.next_txn,
                sets: state.sets.values().map(|s| FileSet::clone(s)).collect(),
                del: state.del,
            };
            (edit, header.clone())
        };

        let tmp = self.dir.join(CATALOG_TMP_FILE);
        let path = self.dir.join(CATALOG_FILE);
        {
            let mut out = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&tmp)?,
            );
            out.write_all(&header.encode()?)?;
            let bytes = edit.encode()?;
            out.write_u32::<BigEndian>(bytes.len() as u32)?;
            out.write_all(&bytes)?;
            out.write_u32::<BigEndian>(CRC32.checksum(&bytes))?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        *writer = BufWriter::new(file);
        self.edit_count.store(1, Ordering::SeqCst);
        tracing::info!(seq = header.current_seq, "catalog snapshot written");
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Reads edits after the header, stopping at the first incomplete record.
struct CatalogIterator {
    reader: BufReader<File>,
    /// End of the last complete record.
    position: u64,
}

impl CatalogIterator {
    fn new(file: File) -> Result<Self> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(Self {
            reader,
            position: HEADER_SIZE as u64,
        })
    }

    fn read_record(&mut self) -> io::Result<Option<(Vec<u8>, u32)>> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut bytes = Vec::new();
        let read = (&mut self.reader).take(len as u64).read_to_end(&mut bytes)?;
        if read < len {
            return Ok(None);
        }
        let checksum = match self.reader.read_u32::<BigEndian>() {
            Ok(checksum) => checksum,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some((bytes, checksum)))
    }
}

impl Iterator for CatalogIterator {
    type Item = Result<CatalogEdit>;

    fn next(&mut self) -> Option<Self::Item> {
        let (bytes, stored) = match self.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => return Some(Err(e.into())),
        };
        let computed = CRC32.checksum(&bytes);
        if computed != stored {
            return Some(Err(Error::ChecksumMismatch {
                context: "catalog edit",
                expected: stored,
                actual: computed,
            }));
        }
        self.position += 4 + bytes.len() as u64 + 4;
        Some(CatalogEdit::decode(&bytes))
    }
}
