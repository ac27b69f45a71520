//! Folding buffered rows and merging them with block rows.

use std::sync::Arc;

use crate::block::DataCols;
use crate::error::Result;
use crate::memtable::TableCursor;
use crate::row::{overwrite_cells, Cell, Key, RowOp, TableId};
use crate::schema::{Schema, SchemaSource};

/// Outcome of merging buffered rows into one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeInfo {
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_delete_succeed: usize,
    pub rows_delete_failed: usize,
    pub n_operations: usize,
    pub key_first: Key,
    pub key_last: Key,
}

impl Default for MergeInfo {
    fn default() -> Self {
        Self {
            rows_inserted: 0,
            rows_updated: 0,
            rows_delete_succeed: 0,
            rows_delete_failed: 0,
            n_operations: 0,
            key_first: Key::MAX,
            key_last: Key::MIN,
        }
    }
}

impl MergeInfo {
    fn touch(&mut self, key: Key) {
        self.key_first = self.key_first.min(key);
        self.key_last = self.key_last.max(key);
    }

    /// Row count of a block holding `rows` once this merge is applied.
    pub fn merged_rows(&self, rows: usize) -> usize {
        (rows + self.rows_inserted).saturating_sub(self.rows_delete_succeed)
    }
}

/// All buffered versions of one key folded into a single operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Folded {
    Put(Vec<Cell>),
    /// A put following a tombstone: replaces any older row entirely.
    Replace(Vec<Cell>),
    Delete,
}

/// Buffered rows of one table inside one partition, folded per key and
/// projected onto the table's current schema.
///
/// Cloning saves the position, which is how merges do a dry run.
#[derive(Clone)]
pub struct MemRows<'a> {
    cursor: TableCursor,
    table: TableId,
    end: Key,
    update: bool,
    target: Arc<Schema>,
    schemas: &'a dyn SchemaSource,
    source: Option<Arc<Schema>>,
}

impl<'a> MemRows<'a> {
    pub fn new(
        mut cursor: TableCursor,
        table: TableId,
        range: (Key, Key),
        update: bool,
        target: Arc<Schema>,
        schemas: &'a dyn SchemaSource,
    ) -> Self {
        cursor.seek(range.0);
        Self {
            cursor,
            table,
            end: range.1,
            update,
            target,
            schemas,
            source: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.target
    }

    /// Next buffered key inside the partition.
    pub fn peek_key(&self) -> Option<Key> {
        self.cursor.peek_key().filter(|k| *k <= self.end)
    }

    /// Folds and consumes every version of the next key if it is `<= limit`.
    ///
    /// Versions apply oldest first: a tombstone replaces whatever came
    /// before it, a put after a tombstone starts over, and later puts either
    /// overwrite cell by cell or are dropped depending on `update`.
    pub fn next_row(&mut self, limit: Key) -> Result<Option<(Key, Folded)>> {
        let Some(key) = self.peek_key().filter(|k| *k <= limit) else {
            return Ok(None);
        };
        let mut state: Option<Folded> = None;
        while let Some(row) = self.cursor.peek().filter(|r| r.key == key) {
            self.cursor.advance();
            match &row.op {
                RowOp::Delete => state = Some(Folded::Delete),
                RowOp::Put(cells) => {
                    let cells = self.project(row.schema_version, cells)?;
                    state = Some(match state {
                        Some(Folded::Put(mut older)) if self.update => {
                            overwrite_cells(&mut older, cells);
                            Folded::Put(older)
                        }
                        Some(Folded::Replace(mut older)) if self.update => {
                            overwrite_cells(&mut older, cells);
                            Folded::Replace(older)
                        }
                        Some(kept @ (Folded::Put(_) | Folded::Replace(_))) => kept,
                        Some(Folded::Delete) => Folded::Replace(settle(cells)),
                        None => Folded::Put(cells),
                    });
                }
            }
        }
        Ok(state.map(|s| (key, s)))
    }

    fn project(&mut self, version: u32, cells: &[Cell]) -> Result<Vec<Cell>> {
        if version == self.target.version {
            return Ok(cells.to_vec());
        }
        let source = match &self.source {
            Some(s) if s.version == version => s.clone(),
            _ => {
                let s = self.schemas.resolve(self.table, Some(version))?;
                self.source = Some(s.clone());
                s
            }
        };
        Ok(self.target.project(&source, cells))
    }
}

/// Replaces cells a row never supplied with nulls, for rows that are not
/// layered over older data.
pub fn settle(cells: Vec<Cell>) -> Vec<Cell> {
    cells
        .into_iter()
        .map(|c| if c == Cell::None { Cell::Null } else { c })
        .collect()
}

/// Consumes buffered rows up to `limit` against the sorted keys of a block.
///
/// With `out` set, the rows a sub-block would carry are appended to it:
/// updates keep unsupplied cells so they layer over the block, inserts are
/// settled. At most `max_rows` rows are appended.
pub fn load_data_from_cache(
    mem: &mut MemRows<'_>,
    limit: Key,
    filter_keys: &[Key],
    max_rows: usize,
    mut out: Option<&mut DataCols>,
) -> Result<MergeInfo> {
    let mut info = MergeInfo::default();
    let mut fi = 0;
    let update = mem.update;
    loop {
        if let Some(out) = out.as_deref() {
            if out.rows() >= max_rows {
                break;
            }
        }
        let Some((key, row)) = mem.next_row(limit)? else {
            break;
        };
        while fi < filter_keys.len() && filter_keys[fi] < key {
            info.touch(filter_keys[fi]);
            fi += 1;
        }
        let on_disk = fi < filter_keys.len() && filter_keys[fi] == key;
        match (row, on_disk) {
            (Folded::Delete, true) => {
                info.rows_delete_succeed += 1;
                info.n_operations += 1;
                fi += 1;
            }
            (Folded::Delete, false) => info.rows_delete_failed += 1,
            (Folded::Put(cells), true) => {
                fi += 1;
                info.touch(key);
                if update {
                    info.rows_updated += 1;
                    info.n_operations += 1;
                    if let Some(out) = out.as_deref_mut() {
                        out.push_row(key, cells)?;
                    }
                }
            }
            (Folded::Replace(cells), true) => {
                fi += 1;
                info.touch(key);
                info.rows_updated += 1;
                info.n_operations += 1;
                if let Some(out) = out.as_deref_mut() {
                    out.push_row(key, cells)?;
                }
            }
            (Folded::Put(cells) | Folded::Replace(cells), false) => {
                info.rows_inserted += 1;
                info.n_operations += 1;
                info.touch(key);
                if let Some(out) = out.as_deref_mut() {
                    out.push_row(key, settle(cells))?;
                }
            }
        }
    }
    for key in &filter_keys[fi..] {
        info.touch(*key);
    }
    Ok(info)
}

/// Merges the rows of a decoded block with buffered rows up to `limit`.
///
/// At equal keys the buffered row overlays the block row when updates are
/// enabled and is dropped otherwise; a tombstone drops the block row.
pub fn load_and_merge(
    disk: &DataCols,
    mem: &mut MemRows<'_>,
    limit: Key,
    out: &mut DataCols,
) -> Result<MergeInfo> {
    let mut info = MergeInfo::default();
    let update = mem.update;
    let mut i = 0;
    while let Some((key, row)) = mem.next_row(limit)? {
        while i < disk.rows() && disk.keys[i] < key {
            out.push_from(disk, i)?;
            i += 1;
        }
        let on_disk = i < disk.rows() && disk.keys[i] == key;
        match (row, on_disk) {
            (Folded::Delete, true) => {
                info.rows_delete_succeed += 1;
                info.n_operations += 1;
                i += 1;
            }
            (Folded::Delete, false) => info.rows_delete_failed += 1,
            (Folded::Put(cells), true) => {
                let mut merged = disk.row_cells(i);
                if update {
                    overwrite_cells(&mut merged, cells);
                    info.rows_updated += 1;
                    info.n_operations += 1;
                }
                out.push_row(key, merged)?;
                i += 1;
            }
            (Folded::Replace(cells), true) => {
                info.rows_updated += 1;
                info.n_operations += 1;
                out.push_row(key, cells)?;
                i += 1;
            }
            (Folded::Put(cells) | Folded::Replace(cells), false) => {
                info.rows_inserted += 1;
                info.n_operations += 1;
                out.push_row(key, settle(cells))?;
            }
        }
    }
    while i < disk.rows() {
        out.push_from(disk, i)?;
        i += 1;
    }
    if let (Some(first), Some(last)) = (out.first_key(), out.last_key()) {
        info.touch(first);
        info.touch(last);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::row::{Row, Value};
    use crate::schema::{norm, Column, ColumnType, SchemaRegistry};

    const T: TableId = TableId { suid: 0, uid: 1 };

    fn registry() -> Result<SchemaRegistry> {
        let reg = SchemaRegistry::new();
        reg.register(T, Schema::new(1, vec![Column::new(2, ColumnType::Int)])?)?;
        reg.register(
            T,
            Schema::new(
                2,
                vec![Column::new(2, ColumnType::Int), Column::new(3, ColumnType::Int)],
            )?,
        )?;
        Ok(reg)
    }

    fn put(mem: &Memtable, key: Key, version: i64, cells: Vec<Cell>) -> Result<()> {
        let mut row = Row::put(key, 2, cells);
        row.version = version;
        mem.put(T, row)
    }

    fn del(mem: &Memtable, key: Key, version: i64) -> Result<()> {
        let mut row = Row::delete(key);
        row.version = version;
        mem.put(T, row)
    }

    fn ints(a: i32, b: i32) -> Vec<Cell> {
        norm(vec![Value::Int(a), Value::Int(b)])
    }

    fn rows<'a>(mem: &Memtable, reg: &'a SchemaRegistry, update: bool) -> Result<MemRows<'a>> {
        let schema = reg.resolve(T, None)?;
        Ok(MemRows::new(mem.cursor(T).unwrap(), T, (0, 99), update, schema, reg))
    }

    #[test]
    fn test_fold_versions() -> Result<()> {
        let reg = registry()?;
        let mem = Memtable::new();
        put(&mem, 1, 1, ints(1, 1))?;
        put(&mem, 1, 2, vec![Cell::None, Cell::Norm(Value::Int(9))])?;
        put(&mem, 2, 3, ints(2, 2))?;
        del(&mem, 2, 4)?;
        del(&mem, 3, 5)?;
        put(&mem, 3, 6, ints(3, 3))?;
        put(&mem, 100, 7, ints(0, 0))?;

        let mut it = rows(&mem, &reg, true)?;
        assert_eq!(it.next_row(99)?, Some((1, Folded::Put(ints(1, 9)))));
        assert_eq!(it.next_row(99)?, Some((2, Folded::Delete)));
        assert_eq!(it.next_row(99)?, Some((3, Folded::Replace(ints(3, 3)))));
        assert_eq!(it.next_row(99)?, None, "key outside the partition");

        let mut it = rows(&mem, &reg, false)?;
        assert_eq!(it.next_row(99)?, Some((1, Folded::Put(ints(1, 1)))));
        Ok(())
    }

    #[test]
    fn test_put_after_tombstone_replaces_disk_row() -> Result<()> {
        let reg = registry()?;
        let mem = Memtable::new();
        del(&mem, 1, 1)?;
        put(&mem, 1, 2, vec![Cell::Norm(Value::Int(4)), Cell::None])?;
        let schema = reg.resolve(T, None)?;

        let mut it = rows(&mem, &reg, true)?;
        assert_eq!(
            it.next_row(99)?,
            Some((1, Folded::Replace(vec![Cell::Norm(Value::Int(4)), Cell::Null])))
        );

        let mut disk = DataCols::new(&schema);
        disk.push_row(1, ints(0, 0))?;
        for update in [true, false] {
            let mut out = DataCols::new(&schema);
            let info = load_and_merge(&disk, &mut rows(&mem, &reg, update)?, 99, &mut out)?;
            assert_eq!(info.rows_updated, 1);
            assert_eq!(out.row_cells(0), vec![Cell::Norm(Value::Int(4)), Cell::Null]);
        }
        Ok(())
    }

    #[test]
    fn test_projects_older_schema() -> Result<()> {
        let reg = registry()?;
        let mem = Memtable::new();
        let mut old = Row::put(5, 1, norm(vec![Value::Int(7)]));
        old.version = 1;
        mem.put(T, old)?;

        let mut it = rows(&mem, &reg, true)?;
        assert_eq!(
            it.next_row(10)?,
            Some((5, Folded::Put(vec![Cell::Norm(Value::Int(7)), Cell::None])))
        );
        Ok(())
    }

    #[test]
    fn test_merge_info_against_block_keys() -> Result<()> {
        let reg = registry()?;
        let mem = Memtable::new();
        put(&mem, 12, 1, ints(1, 1))?;
        put(&mem, 13, 2, ints(1, 1))?;
        del(&mem, 14, 3)?;
        del(&mem, 16, 4)?;
        put(&mem, 25, 5, ints(1, 1))?;

        let disk_keys = [10, 12, 14, 20];
        let mut it = rows(&mem, &reg, true)?;
        let info = load_data_from_cache(&mut it, 20, &disk_keys, usize::MAX, None)?;
        assert_eq!(info.rows_inserted, 1);
        assert_eq!(info.rows_updated, 1);
        assert_eq!(info.rows_delete_succeed, 1);
        assert_eq!(info.rows_delete_failed, 1);
        assert_eq!(info.n_operations, 3);
        assert_eq!((info.key_first, info.key_last), (10, 20));
        assert_eq!(info.merged_rows(4), 4);
        assert_eq!(it.peek_key(), Some(25));
        Ok(())
    }

    #[test]
    fn test_update_disabled_keeps_disk_row() -> Result<()> {
        let reg = registry()?;
        let mem = Memtable::new();
        put(&mem, 1, 1, ints(5, 5))?;
        let schema = reg.resolve(T, None)?;

        let mut disk = DataCols::new(&schema);
        disk.push_row(1, ints(0, 0))?;
        let mut out = DataCols::new(&schema);
        let info = load_and_merge(&disk, &mut rows(&mem, &reg, false)?, 99, &mut out)?;
        assert_eq!(info.n_operations, 0);
        assert_eq!(out.row_cells(0), ints(0, 0));

        let mut out = DataCols::new(&schema);
        load_and_merge(&disk, &mut rows(&mem, &reg, true)?, 99, &mut out)?;
        assert_eq!(out.row_cells(0), ints(5, 5));
        Ok(())
    }

    #[test]
    fn test_load_and_merge_interleaves() -> Result<()> {
        let reg = registry()?;
        let mem = Memtable::new();
        put(&mem, 2, 1, vec![Cell::None, Cell::Norm(Value::Int(22))])?;
        put(&mem, 3, 2, vec![Cell::Norm(Value::Int(3)), Cell::None])?;
        del(&mem, 4, 3)?;
        let schema = reg.resolve(T, None)?;

        let mut disk = DataCols::new(&schema);
        for k in [1, 2, 4, 5] {
            disk.push_row(k, ints(k as i32, k as i32))?;
        }
        let mut out = DataCols::new(&schema);
        let info = load_and_merge(&disk, &mut rows(&mem, &reg, true)?, 99, &mut out)?;
        assert_eq!(out.keys, vec![1, 2, 3, 5]);
        assert_eq!(out.row_cells(1), ints(2, 22));
        assert_eq!(out.row_cells(2), vec![Cell::Norm(Value::Int(3)), Cell::Null]);
        assert_eq!(info.merged_rows(disk.rows()), out.rows());
        Ok(())
    }
}
