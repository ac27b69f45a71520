use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::row::{DeleteOp, Key, Row, Version};

/// Rows and delete operations buffered for one table.
///
/// Rows are keyed by `(key, version)` so every version of a key is kept and
/// iteration yields them oldest first.
#[derive(Debug, Default)]
pub struct TableData {
    rows: SkipMap<(Key, Version), Arc<Row>>,
    deletes: Mutex<Vec<DeleteOp>>,
}

impl TableData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: Row) {
        self.rows.insert((row.key, row.version), Arc::new(row));
    }

    pub fn push_delete(&self, op: DeleteOp) -> Result<()> {
        self.deletes.lock()?.push(op);
        Ok(())
    }

    pub fn deletes(&self) -> Result<Vec<DeleteOp>> {
        Ok(self.deletes.lock()?.clone())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn first_key_from(&self, from: Key) -> Option<Key> {
        self.rows
            .range((Bound::Included((from, Version::MIN)), Bound::Unbounded))
            .next()
            .map(|e| e.key().0)
    }
}

/// Owned forward cursor over one table's buffered rows.
///
/// The cursor holds its own reference to the rows so it stays valid for as
/// long as the snapshot it came from is retained. Cloning a cursor saves its
/// position.
#[derive(Debug, Clone)]
pub struct TableCursor {
    data: Arc<TableData>,
    next: Bound<(Key, Version)>,
}

impl TableCursor {
    pub fn new(data: Arc<TableData>) -> Self {
        Self {
            data,
            next: Bound::Unbounded,
        }
    }

    /// Positions the cursor at the first version of the first key >= `key`.
    pub fn seek(&mut self, key: Key) {
        self.next = Bound::Included((key, Version::MIN));
    }

    pub fn peek(&self) -> Option<Arc<Row>> {
        self.data
            .rows
            .range((self.next, Bound::Unbounded))
            .next()
            .map(|e| e.value().clone())
    }

    pub fn peek_key(&self) -> Option<Key> {
        self.data
            .rows
            .range((self.next, Bound::Unbounded))
            .next()
            .map(|e| e.key().0)
    }

    pub fn advance(&mut self) -> Option<Arc<Row>> {
        let entry = self
            .data
            .rows
            .range((self.next, Bound::Unbounded))
            .next()?;
        self.next = Bound::Excluded(*entry.key());
        Some(entry.value().clone())
    }
}
