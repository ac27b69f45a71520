use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};
use crate::hasher::CRC32;

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"TSCATLG\x01";
const VERSION: u32 = 1;
const BODY_SIZE: usize = 8 + 4 + 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogHeader {
    pub version: u32,
    pub current_seq: u64,
    pub next_txn: u64,
    pub snapshot_interval: u32,
}

impl CatalogHeader {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            version: VERSION,
            current_seq: 0,
            next_txn: 1,
            snapshot_interval,
        }
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<BigEndian>(self.version)?;
        buf.write_u64::<BigEndian>(self.current_seq)?;
        buf.write_u64::<BigEndian>(self.next_txn)?;
        buf.write_u32::<BigEndian>(self.snapshot_interval)?;
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;

        let mut out = [0u8; HEADER_SIZE];
        out[..buf.len()].copy_from_slice(&buf);
        Ok(out)
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let expected = BigEndian::read_u32(&buf[BODY_SIZE..BODY_SIZE + 4]);
        let actual = CRC32.checksum(&buf[..BODY_SIZE]);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                context: "catalog header",
                expected,
                actual,
            });
        }

        let mut cursor = Cursor::new(&buf[..BODY_SIZE]);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(Error::Corrupted("invalid catalog magic".into()));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported catalog version {}",
                version
            )));
        }
        Ok(Self {
            version,
            current_seq: cursor.read_u64::<BigEndian>()?,
            next_txn: cursor.read_u64::<BigEndian>()?,
            snapshot_interval: cursor.read_u32::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() -> Result<()> {
        let mut header = CatalogHeader::new(50);
        header.current_seq = 42;
        header.next_txn = 7;
        let decoded = CatalogHeader::decode(&header.encode()?)?;
        assert_eq!(decoded, header);
        Ok(())
    }

    #[test]
    fn test_invalid_magic() -> Result<()> {
        let mut buf = CatalogHeader::new(10).encode()?;
        buf[0..8].copy_from_slice(b"INVALID!");
        let checksum = CRC32.checksum(&buf[..BODY_SIZE]);
        buf[BODY_SIZE..BODY_SIZE + 4].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(CatalogHeader::decode(&buf), Err(Error::Corrupted(_))));
        Ok(())
    }

    #[test]
    fn test_damaged_header() -> Result<()> {
        let mut buf = CatalogHeader::new(10).encode()?;
        buf[20] ^= 1;
        assert!(matches!(
            CatalogHeader::decode(&buf),
            Err(Error::ChecksumMismatch { .. })
        ));
        Ok(())
    }
}
