//! Parquet chunk writer (the columnar intermediate dialect).
//!
//! Each chunk is a self-describing file with the table's schema declared up
//! front: UTF-8 byte arrays for strings and serialized JSON, INT64 for
//! integers, DATE-annotated INT32 for dates, BOOLEAN for flags. Rows are
//! buffered per table and written as a single row group when the chunk
//! rotates.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use parquet::basic::{ConvertedType, Repetition, Type as PhysicalType};
use parquet::data_type::{BoolType, ByteArray, ByteArrayType, Int32Type, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::{SerializedColumnWriter, SerializedFileWriter};
use parquet::schema::types::Type as SchemaType;
use tracing::debug;

use spl_common::{EtlError, Result};

use super::{chunk_path, ChunkPolicy, IntermediateWriter, WriterStats};
use crate::model::{ColumnKind, Field, RowBatches, Table};

#[derive(Default)]
struct TableBuffer {
    next_index: u32,
    rows: Vec<Vec<Field>>,
    approx_bytes: u64,
}

/// Chunked Parquet writer, one row group per chunk file
pub struct ParquetChunkWriter {
    dir: PathBuf,
    policy: ChunkPolicy,
    buffers: BTreeMap<Table, TableBuffer>,
    finished: Vec<PathBuf>,
    rows_per_table: BTreeMap<&'static str, u64>,
}

impl ParquetChunkWriter {
    pub fn new(dir: &Path, policy: ChunkPolicy) -> Self {
        Self {
            dir: dir.to_path_buf(),
            policy,
            buffers: BTreeMap::new(),
            finished: Vec::new(),
            rows_per_table: BTreeMap::new(),
        }
    }

    fn flush_table(&mut self, table: Table) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(&table) else {
            return Ok(());
        };
        if buffer.rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut buffer.rows);
        buffer.approx_bytes = 0;
        let index = buffer.next_index;
        buffer.next_index += 1;

        let path = chunk_path(&self.dir, table.name(), index, "parquet");
        if let Err(e) = write_chunk_file(&path, table, &rows) {
            // The open chunk is partial; remove it before surfacing the error
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        debug!(
            table = table.name(),
            path = %path.display(),
            rows = rows.len(),
            "Finalized Parquet chunk"
        );
        self.finished.push(path);
        Ok(())
    }
}

impl IntermediateWriter for ParquetChunkWriter {
    fn write_batches(&mut self, batches: &RowBatches) -> Result<()> {
        for (table, rows) in batches.iter() {
            for row in rows {
                let buffer = self.buffers.entry(table).or_default();
                buffer.approx_bytes += approx_row_bytes(row);
                buffer.rows.push(row.clone());
                *self.rows_per_table.entry(table.name()).or_insert(0) += 1;

                let full = buffer.rows.len() >= self.policy.max_rows
                    || buffer.approx_bytes >= self.policy.max_bytes;
                if full {
                    self.flush_table(table)?;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<WriterStats> {
        for table in Table::ALL {
            self.flush_table(table)?;
        }
        Ok(WriterStats {
            rows_per_table: self.rows_per_table.clone(),
            chunks: self.finished.clone(),
        })
    }
}

fn write_chunk_file(path: &Path, table: Table, rows: &[Vec<Field>]) -> Result<()> {
    let schema = table_schema(table)?;
    let props = Arc::new(WriterProperties::builder().build());
    let file = File::create(path)
        .map_err(|e| EtlError::writer(format!("create {}: {e}", path.display())))?;

    let mut writer = SerializedFileWriter::new(file, schema, props).map_err(parquet_err)?;
    let mut row_group = writer.next_row_group().map_err(parquet_err)?;
    let mut column_index = 0;
    while let Some(mut column) = row_group.next_column().map_err(parquet_err)? {
        write_column(&mut column, table, column_index, rows)?;
        column.close().map_err(parquet_err)?;
        column_index += 1;
    }
    row_group.close().map_err(parquet_err)?;
    writer.close().map_err(parquet_err)?;
    Ok(())
}

fn table_schema(table: Table) -> Result<Arc<SchemaType>> {
    let mut fields = Vec::with_capacity(table.columns().len());
    for (name, kind) in table.columns().iter().zip(table.column_kinds()) {
        let (physical, converted) = match kind {
            ColumnKind::Utf8 | ColumnKind::Json => {
                (PhysicalType::BYTE_ARRAY, Some(ConvertedType::UTF8))
            }
            ColumnKind::Int64 => (PhysicalType::INT64, None),
            ColumnKind::Date => (PhysicalType::INT32, Some(ConvertedType::DATE)),
            ColumnKind::Bool => (PhysicalType::BOOLEAN, None),
        };
        let mut builder =
            SchemaType::primitive_type_builder(name, physical).with_repetition(Repetition::OPTIONAL);
        if let Some(converted) = converted {
            builder = builder.with_converted_type(converted);
        }
        fields.push(Arc::new(builder.build().map_err(parquet_err)?));
    }
    SchemaType::group_type_builder(table.name())
        .with_fields(fields)
        .build()
        .map(Arc::new)
        .map_err(parquet_err)
}

fn write_column(
    column: &mut SerializedColumnWriter<'_>,
    table: Table,
    index: usize,
    rows: &[Vec<Field>],
) -> Result<()> {
    let kind = table.column_kinds()[index];
    let column_name = table.columns()[index];
    let mut def_levels: Vec<i16> = Vec::with_capacity(rows.len());

    match kind {
        ColumnKind::Utf8 | ColumnKind::Json => {
            let mut values: Vec<ByteArray> = Vec::new();
            for row in rows {
                match string_cell(&row[index], kind, table, column_name)? {
                    Some(s) => {
                        def_levels.push(1);
                        values.push(ByteArray::from(s.into_bytes()));
                    }
                    None => def_levels.push(0),
                }
            }
            column
                .typed::<ByteArrayType>()
                .write_batch(&values, Some(&def_levels), None)
                .map_err(parquet_err)?;
        }
        ColumnKind::Int64 => {
            let mut values: Vec<i64> = Vec::new();
            for row in rows {
                match &row[index] {
                    Field::Int(v) => {
                        def_levels.push(1);
                        values.push(*v);
                    }
                    Field::Null => def_levels.push(0),
                    other => return Err(cell_mismatch(table, column_name, other)),
                }
            }
            column
                .typed::<Int64Type>()
                .write_batch(&values, Some(&def_levels), None)
                .map_err(parquet_err)?;
        }
        ColumnKind::Date => {
            let mut values: Vec<i32> = Vec::new();
            for row in rows {
                match &row[index] {
                    Field::Date(d) => {
                        def_levels.push(1);
                        values.push(days_since_epoch(*d));
                    }
                    Field::Null => def_levels.push(0),
                    other => return Err(cell_mismatch(table, column_name, other)),
                }
            }
            column
                .typed::<Int32Type>()
                .write_batch(&values, Some(&def_levels), None)
                .map_err(parquet_err)?;
        }
        ColumnKind::Bool => {
            let mut values: Vec<bool> = Vec::new();
            for row in rows {
                match &row[index] {
                    Field::Bool(v) => {
                        def_levels.push(1);
                        values.push(*v);
                    }
                    Field::Null => def_levels.push(0),
                    other => return Err(cell_mismatch(table, column_name, other)),
                }
            }
            column
                .typed::<BoolType>()
                .write_batch(&values, Some(&def_levels), None)
                .map_err(parquet_err)?;
        }
    }
    Ok(())
}

fn string_cell(
    field: &Field,
    kind: ColumnKind,
    table: Table,
    column: &str,
) -> Result<Option<String>> {
    match (kind, field) {
        (_, Field::Null) => Ok(None),
        (ColumnKind::Utf8, Field::Text(s)) => Ok(Some(s.clone())),
        (ColumnKind::Utf8, Field::Uuid(u)) => Ok(Some(u.to_string())),
        (ColumnKind::Json, Field::Json(v)) => Ok(Some(serde_json::to_string(v)?)),
        (_, other) => Err(cell_mismatch(table, column, other)),
    }
}

fn cell_mismatch(table: Table, column: &str, field: &Field) -> EtlError {
    EtlError::writer(format!(
        "unexpected value {field:?} for column {}.{column}",
        table.name()
    ))
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .map(|epoch| (date - epoch).num_days() as i32)
        .unwrap_or(0)
}

fn approx_row_bytes(row: &[Field]) -> u64 {
    row.iter()
        .map(|field| match field {
            Field::Text(s) => s.len() as u64 + 4,
            Field::Json(v) => v.to_string().len() as u64 + 4,
            Field::Uuid(_) => 36,
            _ => 8,
        })
        .sum()
}

fn parquet_err(e: parquet::errors::ParquetError) -> EtlError {
    EtlError::writer(format!("parquet: {e}"))
}

#[cfg(test)]
mod tests {
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use parquet::record::Field as ParquetField;
    use uuid::Uuid;

    use super::*;

    fn ndc_row(ndc: &str) -> Vec<Field> {
        vec![Field::Uuid(Uuid::nil()), Field::Text(ndc.to_string())]
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ParquetChunkWriter::new(dir.path(), ChunkPolicy::default());

        let mut batches = RowBatches::new();
        batches.push(Table::ProductNdcs, ndc_row("0002-1433-80"));
        batches.push(Table::ProductNdcs, ndc_row("0002-1433-61"));
        batches.push(
            Table::MarketingStatus,
            vec![
                Field::Uuid(Uuid::nil()),
                Field::Null,
                Field::Date(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()),
                Field::Null,
            ],
        );
        writer.write_batches(&batches).unwrap();
        let stats = writer.finish().unwrap();

        assert_eq!(stats.total_rows(), 3);
        assert_eq!(stats.chunks.len(), 2);

        let ndc_chunk = stats
            .chunks
            .iter()
            .find(|p| p.to_string_lossy().contains("product_ndcs"))
            .unwrap();
        let reader = SerializedFileReader::new(File::open(ndc_chunk).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);

        let mut rows = reader.get_row_iter(None).unwrap();
        let first = rows.next().unwrap().unwrap();
        let fields: Vec<_> = first.get_column_iter().collect();
        assert_eq!(fields[0].0, "document_id");
        assert_eq!(
            fields[0].1,
            &ParquetField::Str("00000000-0000-0000-0000-000000000000".to_string())
        );
        assert_eq!(fields[1].1, &ParquetField::Str("0002-1433-80".to_string()));
    }

    #[test]
    fn test_nulls_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ParquetChunkWriter::new(dir.path(), ChunkPolicy::default());

        let mut batches = RowBatches::new();
        batches.push(
            Table::MarketingStatus,
            vec![
                Field::Uuid(Uuid::nil()),
                Field::Null,
                Field::Null,
                Field::Null,
            ],
        );
        writer.write_batches(&batches).unwrap();
        let stats = writer.finish().unwrap();

        let reader =
            SerializedFileReader::new(File::open(&stats.chunks[0]).unwrap()).unwrap();
        let mut rows = reader.get_row_iter(None).unwrap();
        let row = rows.next().unwrap().unwrap();
        let fields: Vec<_> = row.get_column_iter().collect();
        assert_eq!(fields[1].1, &ParquetField::Null);
        assert_eq!(fields[2].1, &ParquetField::Null);
    }

    #[test]
    fn test_chunk_rotation_by_rows() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ChunkPolicy {
            max_rows: 2,
            max_bytes: u64::MAX,
        };
        let mut writer = ParquetChunkWriter::new(dir.path(), policy);

        let mut batches = RowBatches::new();
        for i in 0..5 {
            batches.push(Table::ProductNdcs, ndc_row(&format!("ndc-{i}")));
        }
        writer.write_batches(&batches).unwrap();
        let stats = writer.finish().unwrap();

        assert_eq!(stats.chunks.len(), 3);
        assert!(stats.chunks[0].ends_with("product_ndcs.0000.parquet"));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ParquetChunkWriter::new(dir.path(), ChunkPolicy::default());

        let mut batches = RowBatches::new();
        // ndc_code is a string column; an integer cell is a programming error
        batches.push(
            Table::ProductNdcs,
            vec![Field::Uuid(Uuid::nil()), Field::Int(7)],
        );
        writer.write_batches(&batches).unwrap();
        let err = writer.finish().unwrap_err();
        assert!(matches!(err, EtlError::Writer(_)));
    }
}
