//! Column schemas and the lookup seam used to encode and decode rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::row::{Cell, TableId, Value};

pub type ColumnId = u16;

/// Column id reserved for the primary timestamp column.
pub const PRIMARY_KEY_COLUMN: ColumnId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Bool = 1,
    TinyInt = 2,
    SmallInt = 3,
    Int = 4,
    BigInt = 5,
    Float = 6,
    Double = 7,
    Timestamp = 8,
    Binary = 9,
    Varchar = 10,
}

impl ColumnType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ColumnType::Bool),
            2 => Some(ColumnType::TinyInt),
            3 => Some(ColumnType::SmallInt),
            4 => Some(ColumnType::Int),
            5 => Some(ColumnType::BigInt),
            6 => Some(ColumnType::Float),
            7 => Some(ColumnType::Double),
            8 => Some(ColumnType::Timestamp),
            9 => Some(ColumnType::Binary),
            10 => Some(ColumnType::Varchar),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Encoded width of one value, `None` for variable-length types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Bool | ColumnType::TinyInt => Some(1),
            ColumnType::SmallInt => Some(2),
            ColumnType::Int | ColumnType::Float => Some(4),
            ColumnType::BigInt | ColumnType::Double | ColumnType::Timestamp => Some(8),
            ColumnType::Binary | ColumnType::Varchar => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ColumnType::Float | ColumnType::Double)
    }

    /// Types that support min/max/sum aggregates.
    pub fn is_numeric(self) -> bool {
        self.fixed_width().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub id: ColumnId,
    pub ty: ColumnType,
    /// Whether blocks carry aggregate statistics for this column.
    pub sma: bool,
}

impl Column {
    pub fn new(id: ColumnId, ty: ColumnType) -> Self {
        Self { id, ty, sma: true }
    }

    pub fn without_sma(mut self) -> Self {
        self.sma = false;
        self
    }
}

/// A table schema version. `columns[0]` is always the primary timestamp key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub version: u32,
    pub columns: Vec<Column>,
}

impl Schema {
    /// Builds a schema with the primary key column prepended.
    pub fn new(version: u32, value_columns: Vec<Column>) -> Result<Self> {
        let mut columns = Vec::with_capacity(value_columns.len() + 1);
        columns.push(Column::new(PRIMARY_KEY_COLUMN, ColumnType::Timestamp).without_sma());
        for col in value_columns {
            if col.id <= PRIMARY_KEY_COLUMN {
                return Err(Error::InvalidOperation(format!(
                    "column id {} is reserved",
                    col.id
                )));
            }
            if columns.iter().any(|c| c.id == col.id) {
                return Err(Error::InvalidOperation(format!(
                    "duplicate column id {}",
                    col.id
                )));
            }
            columns.push(col);
        }
        Ok(Self { version, columns })
    }

    /// Columns stored in blocks besides the key stream.
    pub fn value_columns(&self) -> &[Column] {
        &self.columns[1..]
    }

    pub fn find(&self, id: ColumnId) -> Option<(usize, &Column)> {
        self.value_columns().iter().enumerate().find(|(_, c)| c.id == id)
    }

    /// Maps cells written under `source` into this schema's column order.
    ///
    /// Columns missing from the source are `Cell::None`; cells whose type no
    /// longer matches become `Cell::Null`.
    pub fn project(&self, source: &Schema, cells: &[Cell]) -> Vec<Cell> {
        if source.version == self.version {
            return cells.to_vec();
        }
        self.value_columns()
            .iter()
            .map(|col| match source.find(col.id) {
                Some((pos, src)) if src.ty == col.ty => {
                    cells.get(pos).cloned().unwrap_or(Cell::None)
                }
                Some(_) => Cell::Null,
                None => Cell::None,
            })
            .collect()
    }

    /// Checks that a row's cells fit this schema.
    pub fn check_cells(&self, cells: &[Cell]) -> Result<()> {
        let cols = self.value_columns();
        if cells.len() != cols.len() {
            return Err(Error::InvalidOperation(format!(
                "row has {} cells, schema version {} has {} value columns",
                cells.len(),
                self.version,
                cols.len()
            )));
        }
        for (cell, col) in cells.iter().zip(cols) {
            if let Cell::Norm(v) = cell {
                if v.column_type() != col.ty {
                    return Err(Error::InvalidOperation(format!(
                        "column {} expects {:?}, got {:?}",
                        col.id,
                        col.ty,
                        v.column_type()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Resolves the schema a table's rows were written with.
pub trait SchemaSource: Send + Sync {
    /// Returns `version` of the table's schema, or the latest when `None`.
    fn resolve(&self, table: TableId, version: Option<u32>) -> Result<Arc<Schema>>;
}

/// In-process schema catalog.
///
/// Child tables without their own entry resolve to their super table's
/// schemas.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<TableId, BTreeMap<u32, Arc<Schema>>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: TableId, schema: Schema) -> Result<()> {
        let mut tables = self.tables.write()?;
        tables
            .entry(table)
            .or_default()
            .insert(schema.version, Arc::new(schema));
        Ok(())
    }

    pub fn drop_table(&self, table: TableId) -> Result<()> {
        self.tables.write()?.remove(&table);
        Ok(())
    }
}

impl SchemaSource for SchemaRegistry {
    fn resolve(&self, table: TableId, version: Option<u32>) -> Result<Arc<Schema>> {
        let tables = self.tables.read()?;
        let versions = tables
            .get(&table)
            .or_else(|| {
                if table.is_child() {
                    tables.get(&TableId::child(table.suid, table.suid))
                } else {
                    None
                }
            })
            .ok_or_else(|| Error::NotFound(format!("table {}", table)))?;

        let schema = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        schema
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("schema {:?} of table {}", version, table)))
    }
}

/// Convenience for tests and callers building rows by hand.
pub fn norm(values: Vec<Value>) -> Vec<Cell> {
    values.into_iter().map(Cell::Norm).collect()
}
