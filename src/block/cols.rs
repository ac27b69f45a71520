use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::ops::Range;

use super::bitmap::{self, BitmapMode};
use crate::error::{Error, Result};
use crate::row::{Cell, Key, Value};
use crate::schema::{ColumnId, ColumnType, Schema};

/// One column of a [`DataCols`] buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCol {
    pub id: ColumnId,
    pub ty: ColumnType,
    pub sma: bool,
    pub cells: Vec<Cell>,
}

/// Column-major row buffer for one table, reused block after block.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCols {
    pub keys: Vec<Key>,
    pub cols: Vec<DataCol>,
}

impl DataCols {
    pub fn new(schema: &Schema) -> Self {
        Self {
            keys: Vec::new(),
            cols: schema
                .value_columns()
                .iter()
                .map(|c| DataCol {
                    id: c.id,
                    ty: c.ty,
                    sma: c.sma,
                    cells: Vec::new(),
                })
                .collect(),
        }
    }

    /// Clears all rows while keeping allocated capacity.
    pub fn reset(&mut self) {
        self.keys.clear();
        for col in &mut self.cols {
            col.cells.clear();
        }
    }

    pub fn rows(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn first_key(&self) -> Option<Key> {
        self.keys.first().copied()
    }

    pub fn last_key(&self) -> Option<Key> {
        self.keys.last().copied()
    }

    pub fn push_row(&mut self, key: Key, cells: Vec<Cell>) -> Result<()> {
        if cells.len() != self.cols.len() {
            return Err(Error::InvalidOperation(format!(
                "row has {} cells, buffer has {} columns",
                cells.len(),
                self.cols.len()
            )));
        }
        self.keys.try_reserve(1)?;
        self.keys.push(key);
        for (col, cell) in self.cols.iter_mut().zip(cells) {
            col.cells.try_reserve(1)?;
            col.cells.push(cell);
        }
        Ok(())
    }

    /// Appends row `idx` of `src`, which must share this buffer's columns.
    pub fn push_from(&mut self, src: &DataCols, idx: usize) -> Result<()> {
        self.push_row(src.keys[idx], src.row_cells(idx))
    }

    pub fn row_cells(&self, idx: usize) -> Vec<Cell> {
        self.cols.iter().map(|c| c.cells[idx].clone()).collect()
    }

    /// Copies the rows in `range` into a new buffer.
    pub fn extract(&self, range: Range<usize>) -> DataCols {
        DataCols {
            keys: self.keys[range.clone()].to_vec(),
            cols: self
                .cols
                .iter()
                .map(|c| DataCol {
                    id: c.id,
                    ty: c.ty,
                    sma: c.sma,
                    cells: c.cells[range.clone()].to_vec(),
                })
                .collect(),
        }
    }

    /// Applies a newer layer of rows on top of this one.
    ///
    /// Keys only present in one side are kept; at equal keys the newer
    /// row's cells overwrite, except cells the newer row did not supply.
    pub fn overlay(&self, newer: &DataCols) -> Result<DataCols> {
        let mut out = DataCols {
            keys: Vec::with_capacity(self.rows() + newer.rows()),
            cols: self
                .cols
                .iter()
                .map(|c| DataCol {
                    id: c.id,
                    ty: c.ty,
                    sma: c.sma,
                    cells: Vec::new(),
                })
                .collect(),
        };

        let (mut i, mut j) = (0, 0);
        while i < self.rows() || j < newer.rows() {
            let take_old = j >= newer.rows() || (i < self.rows() && self.keys[i] < newer.keys[j]);
            let take_new = i >= self.rows() || (j < newer.rows() && newer.keys[j] < self.keys[i]);
            if take_old {
                out.push_from(self, i)?;
                i += 1;
            } else if take_new {
                out.push_from(newer, j)?;
                j += 1;
            } else {
                let mut cells = self.row_cells(i);
                crate::row::overwrite_cells(&mut cells, newer.row_cells(j));
                out.push_row(self.keys[i], cells)?;
                i += 1;
                j += 1;
            }
        }
        Ok(out)
    }
}

/// Appends the raw value stream of `cells`; null cells store a zero value.
pub fn encode_values(cells: &[Cell], ty: ColumnType, out: &mut Vec<u8>) -> Result<()> {
    let zero = Value::zero(ty);
    for cell in cells {
        let value = match cell {
            Cell::Norm(v) if v.column_type() == ty => v,
            Cell::Norm(v) => {
                return Err(Error::InvalidOperation(format!(
                    "{:?} value in {:?} column",
                    v.column_type(),
                    ty
                )))
            }
            _ => &zero,
        };
        encode_value(value, out)?;
    }
    Ok(())
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    out.try_reserve(16)?;
    match value {
        Value::Bool(v) => out.write_u8(*v as u8)?,
        Value::TinyInt(v) => out.write_i8(*v)?,
        Value::SmallInt(v) => out.write_i16::<BigEndian>(*v)?,
        Value::Int(v) => out.write_i32::<BigEndian>(*v)?,
        Value::BigInt(v) | Value::Timestamp(v) => out.write_i64::<BigEndian>(*v)?,
        Value::Float(v) => out.write_f32::<BigEndian>(*v)?,
        Value::Double(v) => out.write_f64::<BigEndian>(*v)?,
        Value::Binary(b) => {
            out.try_reserve(b.len())?;
            out.write_u32::<BigEndian>(b.len() as u32)?;
            out.extend_from_slice(b);
        }
        Value::Varchar(s) => {
            out.try_reserve(s.len())?;
            out.write_u32::<BigEndian>(s.len() as u32)?;
            out.extend_from_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn decode_value(cursor: &mut Cursor<&[u8]>, ty: ColumnType) -> Result<Value> {
    Ok(match ty {
        ColumnType::Bool => Value::Bool(cursor.read_u8()? != 0),
        ColumnType::TinyInt => Value::TinyInt(cursor.read_i8()?),
        ColumnType::SmallInt => Value::SmallInt(cursor.read_i16::<BigEndian>()?),
        ColumnType::Int => Value::Int(cursor.read_i32::<BigEndian>()?),
        ColumnType::BigInt => Value::BigInt(cursor.read_i64::<BigEndian>()?),
        ColumnType::Timestamp => Value::Timestamp(cursor.read_i64::<BigEndian>()?),
        ColumnType::Float => Value::Float(cursor.read_f32::<BigEndian>()?),
        ColumnType::Double => Value::Double(cursor.read_f64::<BigEndian>()?),
        ColumnType::Binary => {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut buf = vec![0u8; len];
            cursor.read_exact(&mut buf)?;
            Value::Binary(buf)
        }
        ColumnType::Varchar => {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut buf = vec![0u8; len];
            cursor.read_exact(&mut buf)?;
            Value::Varchar(
                String::from_utf8(buf)
                    .map_err(|e| Error::Corrupted(format!("varchar cell: {}", e)))?,
            )
        }
    })
}

/// Rebuilds cells from a decoded value stream and its bitmap.
pub fn decode_values(
    values: &[u8],
    bitmap: &[u8],
    mode: BitmapMode,
    ty: ColumnType,
    rows: usize,
) -> Result<Vec<Cell>> {
    let mut cursor = Cursor::new(values);
    let mut cells = Vec::with_capacity(rows);
    for idx in 0..rows {
        let value = decode_value(&mut cursor, ty)
            .map_err(|e| Error::Corrupted(format!("column value {}: {}", idx, e)))?;
        match bitmap::null_at(bitmap, mode, idx)? {
            None => cells.push(Cell::Norm(value)),
            Some(null) => cells.push(null),
        }
    }
    Ok(cells)
}
