use std::fmt;

use crc::{Crc, CRC_32_ISCSI};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Seed of the running integrity tag of an empty file.
pub const INITIAL_TAG: u32 = 0xFFFF_FFFF;

/// Running file-level integrity tag.
///
/// Every block appended to a file folds its checksum into the tag, so the
/// tag recorded in a file header identifies the exact sequence of blocks
/// the file held when the header was written.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Hasher {
    tag: u32,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({:#010x})", self.tag)
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self { tag: INITIAL_TAG }
    }

    /// Resumes from a tag previously stored in a file header.
    pub fn resume(tag: u32) -> Self {
        Self { tag }
    }

    pub fn write(&mut self, data: &[u8]) {
        let mut digest = CRC32.digest();
        digest.update(&self.tag.to_be_bytes());
        digest.update(data);
        self.tag = digest.finalize();
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
