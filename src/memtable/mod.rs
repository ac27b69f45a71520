pub mod active;
pub mod core;
pub mod frozen;
pub mod table;

pub use active::ActiveMemtable;
pub use core::Memtable;
pub use frozen::FrozenMemtable;
pub use table::{TableCursor, TableData};
