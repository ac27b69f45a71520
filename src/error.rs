use std::io;
use std::sync::PoisonError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("checksum mismatch in {context}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        context: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no available storage at level {0}")]
    NoAvailableStorage(u8),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("lock error: {0}")]
    LockError(io::Error),

    #[error("mutex was poisoned")]
    MutexPoisoned,
}

impl Error {
    /// True for failures caused by damaged on-disk bytes.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupted(_) | Error::ChecksumMismatch { .. })
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
