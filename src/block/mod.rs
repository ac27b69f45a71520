//! Column blocks.
//!
//! A block holds the rows of one table for a contiguous key range, stored
//! column by column in the data or last file of a file-set:
//!
//! ```text
//! +-----------------------------------------------------------+
//! | Header                                                    |
//! |   delimiter u32 | suid u64 | uid u64 | rows u32 | flags u8 |
//! |   num_cols u16 | column descriptors (16 bytes each)       |
//! |   crc32 u32                                               |
//! +-----------------------------------------------------------+
//! | Key stream (compressed i64 keys) | crc32 u32              |
//! +-----------------------------------------------------------+
//! | Column 1: compressed values | compressed bitmap | crc32   |
//! +-----------------------------------------------------------+
//! | ...                                                       |
//! +-----------------------------------------------------------+
//! ```
//!
//! The timestamp column is never stored as a column; it is the key stream.
//! Columns holding no values are left out entirely. A crc32 over the whole
//! block is kept in its [`BlockMeta`], and aggregate statistics of
//! super-blocks are written to the file-set's sma file.

pub mod aggregate;
pub mod bitmap;
pub mod cols;
pub mod compress;
pub mod meta;
pub mod reader;
pub mod writer;

pub use aggregate::ColumnAggregate;
pub use bitmap::BitmapMode;
pub use cols::{DataCol, DataCols};
pub use compress::Compression;
pub use meta::{BlockEntry, BlockInfo, BlockMeta};
pub use writer::BlockWriter;

pub(crate) const BLOCK_DELIMITER: u32 = 0xB10C_F00D;
pub(crate) const BLOCK_FLAG_SUPER: u8 = 0x01;
pub(crate) const COL_DESC_SIZE: usize = 16;
/// Header bytes before the column descriptors.
pub(crate) const BLOCK_PREFIX_SIZE: usize = 4 + 8 + 8 + 4 + 1 + 2;

pub(crate) fn header_len(num_cols: usize) -> usize {
    BLOCK_PREFIX_SIZE + num_cols * COL_DESC_SIZE + 4
}
