use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::hasher::CRC32;
use crate::row::{Cell, Value};
use crate::schema::{ColumnId, ColumnType};

/// Encoded size of one column aggregate.
pub const AGGREGATE_SIZE: usize = 2 + 1 + 8 * 3 + 4 * 3;

/// Block-level statistics of one column.
///
/// `min`, `max` and `sum` hold the integer value for integral columns and
/// the IEEE-754 bit pattern of an `f64` for floating point columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnAggregate {
    pub col_id: ColumnId,
    pub ty: ColumnType,
    pub min: i64,
    pub max: i64,
    pub sum: i64,
    pub min_index: u32,
    pub max_index: u32,
    pub null_count: u32,
}

impl ColumnAggregate {
    /// Computes statistics over `cells`, or `None` for non-numeric types.
    pub fn compute(col_id: ColumnId, ty: ColumnType, cells: &[Cell]) -> Option<Self> {
        if !ty.is_numeric() {
            return None;
        }
        let mut agg = Self {
            col_id,
            ty,
            min: 0,
            max: 0,
            sum: 0,
            min_index: 0,
            max_index: 0,
            null_count: 0,
        };

        if ty.is_float() {
            let mut bounds: Option<(f64, f64)> = None;
            let mut sum = 0f64;
            for (i, cell) in cells.iter().enumerate() {
                let Some(v) = cell.value().and_then(Value::as_f64) else {
                    agg.null_count += 1;
                    continue;
                };
                sum += v;
                match bounds.as_mut() {
                    None => {
                        bounds = Some((v, v));
                        agg.min_index = i as u32;
                        agg.max_index = i as u32;
                    }
                    Some((min, max)) => {
                        if v < *min {
                            *min = v;
                            agg.min_index = i as u32;
                        }
                        if v > *max {
                            *max = v;
                            agg.max_index = i as u32;
                        }
                    }
                }
            }
            if let Some((min, max)) = bounds {
                agg.min = min.to_bits() as i64;
                agg.max = max.to_bits() as i64;
            }
            agg.sum = sum.to_bits() as i64;
        } else {
            let mut bounds: Option<(i64, i64)> = None;
            for (i, cell) in cells.iter().enumerate() {
                let Some(v) = cell.value().and_then(Value::as_i64) else {
                    agg.null_count += 1;
                    continue;
                };
                agg.sum = agg.sum.wrapping_add(v);
                match bounds.as_mut() {
                    None => {
                        bounds = Some((v, v));
                        agg.min_index = i as u32;
                        agg.max_index = i as u32;
                    }
                    Some((min, max)) => {
                        if v < *min {
                            *min = v;
                            agg.min_index = i as u32;
                        }
                        if v > *max {
                            *max = v;
                            agg.max_index = i as u32;
                        }
                    }
                }
            }
            if let Some((min, max)) = bounds {
                agg.min = min;
                agg.max = max;
            }
        }
        Some(agg)
    }

    pub fn min_f64(&self) -> f64 {
        f64::from_bits(self.min as u64)
    }

    pub fn max_f64(&self) -> f64 {
        f64::from_bits(self.max as u64)
    }

    pub fn sum_f64(&self) -> f64 {
        f64::from_bits(self.sum as u64)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u16::<BigEndian>(self.col_id)?;
        buf.write_u8(self.ty.to_u8())?;
        buf.write_i64::<BigEndian>(self.min)?;
        buf.write_i64::<BigEndian>(self.max)?;
        buf.write_i64::<BigEndian>(self.sum)?;
        buf.write_u32::<BigEndian>(self.min_index)?;
        buf.write_u32::<BigEndian>(self.max_index)?;
        buf.write_u32::<BigEndian>(self.null_count)?;
        Ok(())
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let col_id = cursor.read_u16::<BigEndian>()?;
        let ty = ColumnType::from_u8(cursor.read_u8()?)
            .ok_or_else(|| Error::Corrupted("unknown column type in aggregate".into()))?;
        Ok(Self {
            col_id,
            ty,
            min: cursor.read_i64::<BigEndian>()?,
            max: cursor.read_i64::<BigEndian>()?,
            sum: cursor.read_i64::<BigEndian>()?,
            min_index: cursor.read_u32::<BigEndian>()?,
            max_index: cursor.read_u32::<BigEndian>()?,
            null_count: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Serializes one block's aggregates as `[count u16][aggregates][crc32]`.
pub fn encode_record(aggs: &[ColumnAggregate], out: &mut Vec<u8>) -> Result<()> {
    out.try_reserve(2 + aggs.len() * AGGREGATE_SIZE + 4)?;
    let start = out.len();
    out.write_u16::<BigEndian>(aggs.len() as u16)?;
    for agg in aggs {
        agg.encode_into(out)?;
    }
    let checksum = CRC32.checksum(&out[start..]);
    out.write_u32::<BigEndian>(checksum)?;
    Ok(())
}

pub fn decode_record(buf: &[u8]) -> Result<Vec<ColumnAggregate>> {
    if buf.len() < 6 {
        return Err(Error::Corrupted("aggregate record too short".into()));
    }
    let (body, tail) = buf.split_at(buf.len() - 4);
    let expected = BigEndian::read_u32(tail);
    let actual = CRC32.checksum(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch {
            context: "aggregate record",
            expected,
            actual,
        });
    }

    let mut cursor = Cursor::new(body);
    let count = cursor.read_u16::<BigEndian>()? as usize;
    (0..count)
        .map(|_| ColumnAggregate::decode_from(&mut cursor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_statistics() {
        let cells = vec![
            Cell::Null,
            Cell::Norm(Value::Int(5)),
            Cell::Norm(Value::Int(-2)),
            Cell::None,
            Cell::Norm(Value::Int(9)),
        ];
        let agg = ColumnAggregate::compute(2, ColumnType::Int, &cells).unwrap();
        assert_eq!(agg.min, -2);
        assert_eq!(agg.max, 9);
        assert_eq!(agg.sum, 12);
        assert_eq!(agg.min_index, 2);
        assert_eq!(agg.max_index, 4);
        assert_eq!(agg.null_count, 2);
    }

    #[test]
    fn test_float_statistics() {
        let cells = vec![
            Cell::Null,
            Cell::Norm(Value::Double(1.5)),
            Cell::Norm(Value::Double(-0.5)),
            Cell::Norm(Value::Double(3.0)),
        ];
        let agg = ColumnAggregate::compute(3, ColumnType::Double, &cells).unwrap();
        assert_eq!(agg.min_f64(), -0.5);
        assert_eq!(agg.max_f64(), 3.0);
        assert_eq!(agg.sum_f64(), 4.0);
        assert_eq!(agg.min_index, 2);
        assert_eq!(agg.max_index, 3);
        assert_eq!(agg.null_count, 1);
    }

    #[test]
    fn test_non_numeric_has_no_aggregate() {
        let cells = vec![Cell::Norm(Value::Varchar("a".into()))];
        assert!(ColumnAggregate::compute(4, ColumnType::Varchar, &cells).is_none());
    }

    #[test]
    fn test_record_checksum_detects_damage() -> Result<()> {
        let agg = ColumnAggregate::compute(2, ColumnType::BigInt, &[Cell::Norm(Value::BigInt(7))])
            .unwrap();
        let mut buf = Vec::new();
        encode_record(&[agg, agg], &mut buf)?;
        assert_eq!(buf.len(), 2 + 2 * AGGREGATE_SIZE + 4);
        assert_eq!(decode_record(&buf)?, vec![agg, agg]);

        buf[5] ^= 0xFF;
        assert!(matches!(
            decode_record(&buf),
            Err(Error::ChecksumMismatch { .. })
        ));
        Ok(())
    }
}
