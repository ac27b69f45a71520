//! Write buffer shared by the active and frozen memtable roles.
//!
//! A memtable maps every table with buffered writes to its [`TableData`]
//! through a concurrent skip list ordered by `(suid, uid)`, so committing
//! walks tables in the same order the block index is persisted in.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use super::table::{TableCursor, TableData};
use crate::error::{Error, Result};
use crate::row::{DeleteOp, Key, Row, TableId};

#[derive(Debug)]
pub struct Memtable {
    tables: SkipMap<TableId, Arc<TableData>>,
    size: AtomicUsize,
    rows: AtomicUsize,
    deletes: AtomicUsize,
    min_key: AtomicI64,
    max_key: AtomicI64,
    frozen: AtomicBool,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            tables: SkipMap::new(),
            size: AtomicUsize::new(0),
            rows: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            min_key: AtomicI64::new(Key::MAX),
            max_key: AtomicI64::new(Key::MIN),
            frozen: AtomicBool::new(false),
        }
    }

    fn table(&self, table: TableId) -> Arc<TableData> {
        self.tables
            .get_or_insert_with(table, || Arc::new(TableData::new()))
            .value()
            .clone()
    }

    pub fn put(&self, table: TableId, row: Row) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::InvalidState("memtable is frozen".into()));
        }
        self.size.fetch_add(row.size_hint(), Ordering::SeqCst);
        self.rows.fetch_add(1, Ordering::SeqCst);
        self.min_key.fetch_min(row.key, Ordering::SeqCst);
        self.max_key.fetch_max(row.key, Ordering::SeqCst);
        self.table(table).insert(row);
        Ok(())
    }

    pub fn delete_range(&self, table: TableId, op: DeleteOp) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::InvalidState("memtable is frozen".into()));
        }
        self.size.fetch_add(std::mem::size_of::<DeleteOp>(), Ordering::SeqCst);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.table(table).push_delete(op)
    }

    /// freeze prevents further writes to the memtable.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("memtable already frozen".into()));
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0 && self.delete_count() == 0
    }

    /// Smallest and largest buffered row keys.
    pub fn key_range(&self) -> Option<(Key, Key)> {
        if self.row_count() == 0 {
            return None;
        }
        Some((
            self.min_key.load(Ordering::SeqCst),
            self.max_key.load(Ordering::SeqCst),
        ))
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.iter().map(|e| *e.key()).collect()
    }

    pub fn table_data(&self, table: TableId) -> Option<Arc<TableData>> {
        self.tables.get(&table).map(|e| e.value().clone())
    }

    pub fn cursor(&self, table: TableId) -> Option<TableCursor> {
        self.table_data(table).map(TableCursor::new)
    }

    /// Smallest row key >= `from` across all tables.
    pub fn next_key_from(&self, from: Key) -> Option<Key> {
        self.tables
            .iter()
            .filter_map(|e| e.value().first_key_from(from))
            .min()
    }

    /// Buffered delete operations per table, in table order.
    pub fn delete_ops(&self) -> Result<Vec<(TableId, Vec<DeleteOp>)>> {
        let mut out = Vec::new();
        for entry in self.tables.iter() {
            let ops = entry.value().deletes()?;
            if !ops.is_empty() {
                out.push((*entry.key(), ops));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Cell;

    fn row(key: Key) -> Row {
        Row::put(key, 1, vec![Cell::Null])
    }

    #[test]
    fn test_put_tracks_counts_and_range() -> Result<()> {
        let mem = Memtable::new();
        assert!(mem.is_empty());
        assert_eq!(mem.key_range(), None);

        mem.put(TableId::normal(1), row(50))?;
        mem.put(TableId::normal(2), row(-3))?;
        mem.put(TableId::normal(1), row(7))?;

        assert_eq!(mem.row_count(), 3);
        assert!(mem.size() > 0);
        assert_eq!(mem.key_range(), Some((-3, 50)));
        assert_eq!(mem.table_ids(), vec![TableId::normal(1), TableId::normal(2)]);
        assert_eq!(mem.next_key_from(0), Some(7));
        assert_eq!(mem.next_key_from(51), None);
        Ok(())
    }

    #[test]
    fn test_frozen_rejects_writes() -> Result<()> {
        let mem = Memtable::new();
        mem.freeze()?;
        assert!(mem.put(TableId::normal(1), row(1)).is_err());
        assert!(mem
            .delete_range(TableId::normal(1), DeleteOp { version: 1, start_key: 0, end_key: 1 })
            .is_err());
        assert!(mem.freeze().is_err());
        Ok(())
    }

    #[test]
    fn test_delete_ops_skip_tables_without_deletes() -> Result<()> {
        let mem = Memtable::new();
        mem.put(TableId::normal(1), row(1))?;
        mem.delete_range(TableId::normal(2), DeleteOp { version: 3, start_key: 0, end_key: 9 })?;
        let ops = mem.delete_ops()?;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, TableId::normal(2));
        assert!(!mem.is_empty());
        Ok(())
    }
}
