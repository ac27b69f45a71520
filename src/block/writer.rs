use byteorder::{BigEndian, WriteBytesExt};

use super::aggregate::{self, ColumnAggregate};
use super::bitmap::{self, BitmapMode};
use super::cols::{self, DataCol, DataCols};
use super::compress::{self, Compression};
use super::meta::BlockMeta;
use super::{BLOCK_DELIMITER, BLOCK_FLAG_SUPER, COL_DESC_SIZE};
use crate::error::{Error, Result};
use crate::fileset::DataFile;
use crate::hasher::CRC32;
use crate::row::{Cell, TableId};

/// Serializes [`DataCols`] into checksummed, compressed blocks.
///
/// All encode buffers are owned by the writer and only cleared between
/// blocks, so steady-state commits do not reallocate.
#[derive(Debug)]
pub struct BlockWriter {
    compression: Compression,
    block: Vec<u8>,
    columns: Vec<u8>,
    raw: Vec<u8>,
    aggr: Vec<u8>,
    aggregates: Vec<ColumnAggregate>,
}

/// Column retained in a block with its location inside the column area.
struct ColDesc {
    id: u16,
    ty: u8,
    mode: BitmapMode,
    offset: u32,
    len: u32,
    blen: u32,
}

impl BlockWriter {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            block: Vec::new(),
            columns: Vec::new(),
            raw: Vec::new(),
            aggr: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Whether a column is left out of the block.
    ///
    /// Super-blocks drop any column without values. Sub-blocks layer over
    /// older data, so explicit nulls must survive there and only columns
    /// the rows never supplied are dropped.
    fn elided(col: &DataCol, is_super: bool) -> bool {
        if is_super {
            col.cells.iter().all(Cell::is_null)
        } else {
            col.cells.iter().all(|c| matches!(c, Cell::None))
        }
    }

    /// Encodes `cols` into the writer's block buffer.
    ///
    /// Returns the key stream length and the number of retained columns.
    fn encode(&mut self, table: TableId, cols: &DataCols, is_super: bool) -> Result<(u32, u16)> {
        self.block.clear();
        self.columns.clear();
        self.aggr.clear();
        self.aggregates.clear();

        let rows = cols.rows();
        let mut descs = Vec::with_capacity(cols.cols.len());
        for col in &cols.cols {
            if Self::elided(col, is_super) {
                continue;
            }
            let mode = BitmapMode::for_cells(&col.cells);
            let start = self.columns.len();

            self.raw.clear();
            cols::encode_values(&col.cells, col.ty, &mut self.raw)?;
            compress::compress_into(&self.raw, self.compression, &mut self.columns)?;
            let values_end = self.columns.len();

            self.raw.clear();
            bitmap::encode_into(&col.cells, mode, &mut self.raw)?;
            compress::compress_into(&self.raw, self.compression, &mut self.columns)?;
            let blen = self.columns.len() - values_end;

            let checksum = CRC32.checksum(&self.columns[start..]);
            self.columns.write_u32::<BigEndian>(checksum)?;

            descs.push(ColDesc {
                id: col.id,
                ty: col.ty.to_u8(),
                mode,
                offset: start as u32,
                len: (self.columns.len() - start) as u32,
                blen: blen as u32,
            });

            if is_super && col.sma {
                if let Some(agg) = ColumnAggregate::compute(col.id, col.ty, &col.cells) {
                    self.aggregates.push(agg);
                }
            }
        }

        let header_len = super::header_len(descs.len());
        self.block
            .try_reserve(header_len + rows * 8 + self.columns.len() + 8)?;
        self.block.write_u32::<BigEndian>(BLOCK_DELIMITER)?;
        self.block.write_u64::<BigEndian>(table.suid)?;
        self.block.write_u64::<BigEndian>(table.uid)?;
        self.block.write_u32::<BigEndian>(rows as u32)?;
        self.block
            .write_u8(if is_super { BLOCK_FLAG_SUPER } else { 0 })?;
        self.block.write_u16::<BigEndian>(descs.len() as u16)?;
        for desc in &descs {
            self.block.write_u16::<BigEndian>(desc.id)?;
            self.block.write_u8(desc.ty)?;
            self.block.write_u8(desc.mode as u8)?;
            self.block.write_u32::<BigEndian>(desc.offset)?;
            self.block.write_u32::<BigEndian>(desc.len)?;
            self.block.write_u32::<BigEndian>(desc.blen)?;
        }
        debug_assert_eq!(self.block.len() + 4, header_len);
        debug_assert_eq!(COL_DESC_SIZE, 16);
        let header_crc = CRC32.checksum(&self.block);
        self.block.write_u32::<BigEndian>(header_crc)?;

        let key_start = self.block.len();
        self.raw.clear();
        self.raw.try_reserve(rows * 8)?;
        for key in &cols.keys {
            self.raw.write_i64::<BigEndian>(*key)?;
        }
        compress::compress_into(&self.raw, self.compression, &mut self.block)?;
        let key_crc = CRC32.checksum(&self.block[key_start..]);
        self.block.write_u32::<BigEndian>(key_crc)?;
        let key_len = (self.block.len() - key_start) as u32;

        self.block.extend_from_slice(&self.columns);

        if !self.aggregates.is_empty() {
            aggregate::encode_record(&self.aggregates, &mut self.aggr)?;
        }
        Ok((key_len, descs.len() as u16))
    }

    /// Writes one block of `cols` to `dst`, with its aggregates going to `sma`.
    ///
    /// The block is fully encoded in memory before anything is appended, so
    /// an encode failure leaves both files untouched.
    pub fn write(
        &mut self,
        table: TableId,
        cols: &DataCols,
        dst: &mut DataFile,
        sma: &mut DataFile,
        is_super: bool,
        last: bool,
    ) -> Result<BlockMeta> {
        let (min_key, max_key) = match (cols.first_key(), cols.last_key()) {
            (Some(min), Some(max)) => (min, max),
            _ => {
                return Err(Error::InvalidOperation(format!(
                    "empty block for table {}",
                    table
                )))
            }
        };

        let (key_len, num_cols) = self.encode(table, cols, is_super)?;
        let checksum = CRC32.checksum(&self.block);

        let offset = dst.append(&self.block)?;
        dst.fold_checksum(checksum);
        let info = dst.info_mut();
        info.total_blocks += 1;
        info.total_rows += cols.rows() as u64;

        let (aggr_offset, aggr_len) = if self.aggr.is_empty() {
            (0, 0)
        } else {
            let aggr_offset = sma.append(&self.aggr)?;
            sma.fold_checksum(CRC32.checksum(&self.aggr));
            sma.info_mut().total_blocks += 1;
            (aggr_offset, self.aggr.len() as u32)
        };

        Ok(BlockMeta {
            last,
            algorithm: self.compression,
            num_sub_blocks: if is_super { 1 } else { 0 },
            num_cols,
            num_bsma: self.aggregates.len() as u16,
            offset,
            len: self.block.len() as u32,
            key_len,
            num_rows: cols.rows() as u32,
            min_key,
            max_key,
            aggr_offset,
            aggr_len,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::aggregate::decode_record;
    use super::super::reader::{decode_block, decode_header, decode_keys};
    use super::*;
    use crate::fileset::FileKind;
    use crate::row::Value;
    use crate::schema::{Column, ColumnType, Schema};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(
            1,
            vec![
                Column::new(2, ColumnType::Int),
                Column::new(3, ColumnType::Double),
                Column::new(4, ColumnType::Varchar).without_sma(),
                Column::new(5, ColumnType::BigInt),
            ],
        )
        .unwrap()
    }

    fn sample(rows: i64) -> DataCols {
        let mut cols = DataCols::new(&schema());
        for k in 0..rows {
            cols.push_row(
                k * 10,
                vec![
                    if k % 3 == 0 { Cell::Null } else { Cell::Norm(Value::Int(k as i32)) },
                    Cell::Norm(Value::Double(k as f64 / 2.0)),
                    Cell::Norm(Value::Varchar(format!("row-{}", k))),
                    Cell::Null,
                ],
            )
            .unwrap();
        }
        cols
    }

    fn files(dir: &TempDir) -> Result<(DataFile, DataFile)> {
        Ok((
            DataFile::create(dir.path(), 0, 1, FileKind::Data)?,
            DataFile::create(dir.path(), 0, 1, FileKind::Sma)?,
        ))
    }

    #[test]
    fn test_block_roundtrip_elides_null_column() -> Result<()> {
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let dir = TempDir::new()?;
            let (mut data, mut sma) = files(&dir)?;
            let cols = sample(20);
            let table = TableId::child(7, 8);

            let mut writer = BlockWriter::new(compression);
            let meta = writer.write(table, &cols, &mut data, &mut sma, true, false)?;
            assert_eq!(meta.num_rows, 20);
            assert_eq!((meta.min_key, meta.max_key), (0, 190));
            assert_eq!(meta.num_cols, 3, "all-null column must be elided");
            assert_eq!(meta.algorithm, compression);

            let buf = data.read_at(meta.offset, meta.len as usize)?;
            let header = decode_header(&buf)?;
            assert_eq!(header.table, table);
            assert!(header.is_super);
            assert!(header.cols.iter().all(|c| c.id != 5));

            let decoded = decode_block(&buf, &meta, &schema())?;
            assert_eq!(decoded, cols);
        }
        Ok(())
    }

    #[test]
    fn test_super_block_writes_aggregates() -> Result<()> {
        let dir = TempDir::new()?;
        let (mut data, mut sma) = files(&dir)?;
        let mut writer = BlockWriter::new(Compression::Lz4);
        let meta = writer.write(TableId::normal(1), &sample(6), &mut data, &mut sma, true, true)?;

        assert!(meta.last);
        assert_eq!(meta.num_bsma, 2, "int and double columns carry aggregates");
        let aggs = decode_record(&sma.read_at(meta.aggr_offset, meta.aggr_len as usize)?)?;
        let int_agg = aggs.iter().find(|a| a.col_id == 2).unwrap();
        assert_eq!(int_agg.null_count, 2);
        assert_eq!((int_agg.min, int_agg.max, int_agg.sum), (1, 5, 1 + 2 + 4 + 5));
        let dbl_agg = aggs.iter().find(|a| a.col_id == 3).unwrap();
        assert_eq!(dbl_agg.max_f64(), 2.5);
        Ok(())
    }

    #[test]
    fn test_sub_block_keeps_unsupplied_cells() -> Result<()> {
        let dir = TempDir::new()?;
        let (mut data, mut sma) = files(&dir)?;
        let mut cols = DataCols::new(&schema());
        cols.push_row(5, vec![Cell::None, Cell::Null, Cell::None, Cell::None])?;
        cols.push_row(6, vec![Cell::Norm(Value::Int(1)), Cell::Null, Cell::None, Cell::None])?;

        let mut writer = BlockWriter::new(Compression::Lz4);
        let meta = writer.write(TableId::normal(1), &cols, &mut data, &mut sma, false, false)?;
        assert_eq!(meta.num_sub_blocks, 0);
        assert_eq!(meta.aggr_len, 0);
        assert_eq!(meta.num_cols, 2, "explicit nulls survive, unsupplied columns do not");

        let decoded = decode_block(&data.read_at(meta.offset, meta.len as usize)?, &meta, &schema())?;
        assert_eq!(decoded, cols);
        assert_eq!(decode_keys(&data.read_at(meta.offset, meta.len as usize)?, &meta)?, vec![5, 6]);
        Ok(())
    }

    #[test]
    fn test_integrity_tag_and_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let (mut data, mut sma) = files(&dir)?;
        let before = data.info().magic;
        let mut writer = BlockWriter::new(Compression::None);
        let meta = writer.write(TableId::normal(1), &sample(4), &mut data, &mut sma, true, false)?;
        assert_ne!(data.info().magic, before);
        assert_eq!(data.info().total_blocks, 1);
        assert_eq!(data.info().total_rows, 4);

        let mut buf = data.read_at(meta.offset, meta.len as usize)?;
        let last = buf.len() - 6;
        buf[last] ^= 0xFF;
        let err = decode_block(&buf, &meta, &schema()).unwrap_err();
        assert!(err.is_corruption());
        Ok(())
    }

    #[test]
    fn test_empty_block_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (mut data, mut sma) = files(&dir)?;
        let mut writer = BlockWriter::new(Compression::Lz4);
        let cols = DataCols::new(&schema());
        assert!(writer
            .write(TableId::normal(1), &cols, &mut data, &mut sma, true, false)
            .is_err());
        assert_eq!(data.size(), crate::fileset::FILE_HEADER_SIZE);
        Ok(())
    }
}
