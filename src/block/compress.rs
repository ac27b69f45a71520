//! Column compression.
//!
//! Values and null bitmaps are compressed independently with the algorithm
//! configured for the storage unit; the algorithm id is recorded in every
//! block's metadata so blocks written under an older setting stay readable.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Compresses `data`, appending the result to `out`.
pub fn compress_into(data: &[u8], algo: Compression, out: &mut Vec<u8>) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match algo {
        Compression::None => {
            out.try_reserve(data.len())?;
            out.extend_from_slice(data);
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            out.try_reserve(compressed.len())?;
            out.extend_from_slice(&compressed);
        }
        Compression::Zstd => {
            let compressed =
                zstd::encode_all(data, 3).map_err(|e| Error::Compression(e.to_string()))?;
            out.try_reserve(compressed.len())?;
            out.extend_from_slice(&compressed);
        }
    }
    Ok(())
}

pub fn decompress(data: &[u8], algo: Compression) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    match algo {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Corrupted(format!("lz4 column payload: {}", e))),
        Compression::Zstd => zstd::decode_all(data)
            .map_err(|e| Error::Corrupted(format!("zstd column payload: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algo: Compression) -> Result<()> {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i % 7).to_be_bytes()).collect();
        let mut out = vec![0xAA];
        compress_into(&data, algo, &mut out)?;
        assert_eq!(out[0], 0xAA, "existing bytes must be preserved");
        if algo != Compression::None {
            assert!(out.len() - 1 < data.len());
        }
        assert_eq!(decompress(&out[1..], algo)?, data);
        Ok(())
    }

    #[test]
    fn test_roundtrip_all_algorithms() -> Result<()> {
        roundtrip(Compression::None)?;
        roundtrip(Compression::Lz4)?;
        roundtrip(Compression::Zstd)
    }

    #[test]
    fn test_empty_payload_stays_empty() -> Result<()> {
        let mut out = Vec::new();
        compress_into(&[], Compression::Zstd, &mut out)?;
        assert!(out.is_empty());
        assert!(decompress(&[], Compression::Lz4)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_garbage_is_corruption() {
        let err = decompress(b"definitely not zstd", Compression::Zstd).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(Compression::from_u8(9), None);
    }
}
