use std::sync::Arc;

use super::{core::Memtable, frozen::FrozenMemtable};
use crate::error::Result;
use crate::row::{DeleteOp, Row, TableId};

/// The memtable currently accepting writes.
#[derive(Debug, Default)]
pub struct ActiveMemtable {
    memtable: Arc<Memtable>,
    generation: u64,
}

impl ActiveMemtable {
    pub fn new(generation: u64) -> Self {
        Self {
            memtable: Arc::new(Memtable::new()),
            generation,
        }
    }

    /// Seals the memtable and hands its rows over to a frozen snapshot.
    pub fn freeze(&self) -> Result<FrozenMemtable> {
        self.memtable.freeze()?;
        Ok(FrozenMemtable::new(self.memtable.clone(), self.generation))
    }

    pub fn put(&self, table: TableId, row: Row) -> Result<()> {
        self.memtable.put(table, row)
    }

    pub fn delete_range(&self, table: TableId, op: DeleteOp) -> Result<()> {
        self.memtable.delete_range(table, op)
    }

    pub fn size(&self) -> usize {
        self.memtable.size()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }
}
