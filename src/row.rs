//! Keys, table identities and the row/cell values flowing from the write
//! buffer into column blocks.

use std::fmt;

use crate::schema::ColumnType;

/// Primary timestamp key of a row.
pub type Key = i64;

/// Write version assigned when a row or delete operation is ingested.
pub type Version = i64;

/// Identity of a table inside a storage unit.
///
/// `suid == 0` marks a standalone table, `suid == uid` a super table, and
/// anything else a child table of super table `suid`. The derived ordering
/// is `(suid, uid)`, which is the merge-join order of every index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId {
    pub suid: u64,
    pub uid: u64,
}

impl TableId {
    pub fn normal(uid: u64) -> Self {
        Self { suid: 0, uid }
    }

    pub fn child(suid: u64, uid: u64) -> Self {
        Self { suid, uid }
    }

    pub fn is_child(&self) -> bool {
        self.suid != 0 && self.suid != self.uid
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.suid, self.uid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Timestamp(i64),
    Binary(Vec<u8>),
    Varchar(String),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Bool(_) => ColumnType::Bool,
            Value::TinyInt(_) => ColumnType::TinyInt,
            Value::SmallInt(_) => ColumnType::SmallInt,
            Value::Int(_) => ColumnType::Int,
            Value::BigInt(_) => ColumnType::BigInt,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Binary(_) => ColumnType::Binary,
            Value::Varchar(_) => ColumnType::Varchar,
        }
    }

    /// Integer view used for ordering and summing integral columns.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(v) => Some(*v as i64),
            Value::TinyInt(v) => Some(*v as i64),
            Value::SmallInt(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Zero value of a column type, stored under null cells.
    pub fn zero(ty: ColumnType) -> Value {
        match ty {
            ColumnType::Bool => Value::Bool(false),
            ColumnType::TinyInt => Value::TinyInt(0),
            ColumnType::SmallInt => Value::SmallInt(0),
            ColumnType::Int => Value::Int(0),
            ColumnType::BigInt => Value::BigInt(0),
            ColumnType::Float => Value::Float(0.0),
            ColumnType::Double => Value::Double(0.0),
            ColumnType::Timestamp => Value::Timestamp(0),
            ColumnType::Binary => Value::Binary(Vec::new()),
            ColumnType::Varchar => Value::Varchar(String::new()),
        }
    }
}

/// One column cell of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Norm(Value),
    /// Explicit null.
    Null,
    /// Not supplied by the write; never overwrites an older value.
    None,
}

impl Cell {
    pub fn is_null(&self) -> bool {
        !matches!(self, Cell::Norm(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Cell::Norm(v) => Some(v),
            _ => None,
        }
    }

    /// Folds a newer cell over this one with overwrite semantics.
    pub fn overwrite(&mut self, newer: Cell) {
        if newer != Cell::None {
            *self = newer;
        }
    }
}

/// Folds the cells of a newer row version over an older one.
pub fn overwrite_cells(older: &mut [Cell], newer: Vec<Cell>) {
    for (old, new) in older.iter_mut().zip(newer) {
        old.overwrite(new);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Cells in the column order of the row's schema version, key column excluded.
    Put(Vec<Cell>),
    /// Row tombstone for the key.
    Delete,
}

/// A versioned row as ingested into the write buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: Key,
    pub version: Version,
    pub schema_version: u32,
    pub op: RowOp,
}

impl Row {
    pub fn put(key: Key, schema_version: u32, cells: Vec<Cell>) -> Self {
        Self {
            key,
            version: 0,
            schema_version,
            op: RowOp::Put(cells),
        }
    }

    pub fn delete(key: Key) -> Self {
        Self {
            key,
            version: 0,
            schema_version: 0,
            op: RowOp::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.op, RowOp::Delete)
    }

    /// Approximate in-memory footprint used for buffer accounting.
    pub fn size_hint(&self) -> usize {
        let cells = match &self.op {
            RowOp::Put(cells) => cells
                .iter()
                .map(|c| match c {
                    Cell::Norm(Value::Binary(b)) => b.len() + 8,
                    Cell::Norm(Value::Varchar(s)) => s.len() + 8,
                    _ => 9,
                })
                .sum(),
            RowOp::Delete => 0,
        };
        24 + cells
    }
}

/// A delete-range operation `[start_key, end_key]` recorded at `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOp {
    pub version: Version,
    pub start_key: Key,
    pub end_key: Key,
}
