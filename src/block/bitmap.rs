//! Null bitmaps.
//!
//! `One` stores a single bit per row, set when the row holds a value. `Two`
//! stores two bits per row so a column can also tell "explicit null" apart
//! from "not supplied":
//!
//! ```text
//! 0b00 value    0b01 not supplied    0b10 null
//! ```

use crate::error::{Error, Result};
use crate::row::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitmapMode {
    One = 1,
    Two = 2,
}

impl BitmapMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(BitmapMode::One),
            2 => Some(BitmapMode::Two),
            _ => None,
        }
    }

    /// Narrowest mode able to represent every cell.
    pub fn for_cells(cells: &[Cell]) -> Self {
        if cells.iter().any(|c| matches!(c, Cell::None)) {
            BitmapMode::Two
        } else {
            BitmapMode::One
        }
    }

    pub fn encoded_len(self, rows: usize) -> usize {
        match self {
            BitmapMode::One => (rows + 7) / 8,
            BitmapMode::Two => (rows + 3) / 4,
        }
    }
}

const TWO_VALUE: u8 = 0b00;
const TWO_NONE: u8 = 0b01;
const TWO_NULL: u8 = 0b10;

/// Appends the bitmap of `cells` to `out`.
pub fn encode_into(cells: &[Cell], mode: BitmapMode, out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();
    let len = mode.encoded_len(cells.len());
    out.try_reserve(len)?;
    out.resize(start + len, 0);
    let bits = &mut out[start..];

    for (i, cell) in cells.iter().enumerate() {
        match mode {
            BitmapMode::One => {
                if !cell.is_null() {
                    bits[i / 8] |= 1u8 << (i % 8);
                }
            }
            BitmapMode::Two => {
                let code = match cell {
                    Cell::Norm(_) => TWO_VALUE,
                    Cell::None => TWO_NONE,
                    Cell::Null => TWO_NULL,
                };
                bits[i / 4] |= code << ((i % 4) * 2);
            }
        }
    }
    Ok(())
}

/// Null kind of row `idx`, `None` when the row holds a value.
pub fn null_at(bitmap: &[u8], mode: BitmapMode, idx: usize) -> Result<Option<Cell>> {
    match mode {
        BitmapMode::One => {
            let byte = bitmap
                .get(idx / 8)
                .ok_or_else(|| Error::Corrupted(format!("bitmap too short for row {}", idx)))?;
            if (byte >> (idx % 8)) & 1 == 1 {
                Ok(None)
            } else {
                Ok(Some(Cell::Null))
            }
        }
        BitmapMode::Two => {
            let byte = bitmap
                .get(idx / 4)
                .ok_or_else(|| Error::Corrupted(format!("bitmap too short for row {}", idx)))?;
            match (byte >> ((idx % 4) * 2)) & 0b11 {
                TWO_VALUE => Ok(None),
                TWO_NONE => Ok(Some(Cell::None)),
                TWO_NULL => Ok(Some(Cell::Null)),
                code => Err(Error::Corrupted(format!(
                    "invalid bitmap code {:#04b} at row {}",
                    code, idx
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    fn sample() -> Vec<Cell> {
        (0..19)
            .map(|i| match i % 3 {
                0 => Cell::Norm(Value::Int(i)),
                1 => Cell::Null,
                _ => Cell::None,
            })
            .collect()
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(BitmapMode::for_cells(&sample()), BitmapMode::Two);
        assert_eq!(
            BitmapMode::for_cells(&[Cell::Null, Cell::Norm(Value::Int(1))]),
            BitmapMode::One
        );
        assert_eq!(BitmapMode::One.encoded_len(9), 2);
        assert_eq!(BitmapMode::Two.encoded_len(9), 3);
    }

    #[test]
    fn test_two_bit_keeps_null_kinds() -> Result<()> {
        let cells = sample();
        let mut out = Vec::new();
        encode_into(&cells, BitmapMode::Two, &mut out)?;

        for (i, cell) in cells.iter().enumerate() {
            let decoded = null_at(&out, BitmapMode::Two, i)?;
            match cell {
                Cell::Norm(_) => assert_eq!(decoded, None),
                other => assert_eq!(decoded.as_ref(), Some(other)),
            }
        }
        Ok(())
    }

    #[test]
    fn test_one_bit_marks_every_null() -> Result<()> {
        let cells: Vec<Cell> = (0..10)
            .map(|i| if i % 4 == 0 { Cell::Null } else { Cell::Norm(Value::Int(i)) })
            .collect();
        let mut out = Vec::new();
        encode_into(&cells, BitmapMode::One, &mut out)?;
        assert_eq!(out.len(), 2);

        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(null_at(&out, BitmapMode::One, i)?.is_some(), cell.is_null());
        }
        assert!(null_at(&out, BitmapMode::One, 16).is_err());
        Ok(())
    }
}
