//! CSV chunk writer.
//!
//! Dialect, chosen to feed PostgreSQL `COPY ... (FORMAT csv)` directly:
//! RFC 4180 framing, `,` delimiter, `"` quote with doubling, `\n`
//! terminator, UTF-8 without BOM, `\N` null sentinel, booleans as `t`/`f`,
//! dates as ISO 8601, timestamps as RFC 3339 in UTC. JSON payloads are
//! serialized then CSV-escaped; real newlines stay inside quoted fields.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use tracing::debug;

use spl_common::{EtlError, Result};

use super::{chunk_path, ChunkPolicy, IntermediateWriter, WriterStats};
use crate::model::{Field, RowBatches, Table};

struct OpenChunk {
    path: PathBuf,
    file: BufWriter<File>,
    rows: usize,
    bytes: u64,
}

#[derive(Default)]
struct TableState {
    next_index: u32,
    open: Option<OpenChunk>,
}

/// Chunked CSV writer, one file per (table, chunk)
pub struct CsvChunkWriter {
    dir: PathBuf,
    policy: ChunkPolicy,
    states: BTreeMap<Table, TableState>,
    finished: Vec<PathBuf>,
    rows_per_table: BTreeMap<&'static str, u64>,
}

impl CsvChunkWriter {
    pub fn new(dir: &Path, policy: ChunkPolicy) -> Self {
        Self {
            dir: dir.to_path_buf(),
            policy,
            states: BTreeMap::new(),
            finished: Vec::new(),
            rows_per_table: BTreeMap::new(),
        }
    }

    fn write_row(&mut self, table: Table, row: &[Field]) -> Result<()> {
        let line = encode_row(row)?;

        let state = self.states.entry(table).or_default();
        let chunk = match state.open.as_mut() {
            Some(chunk) => chunk,
            None => {
                let path = chunk_path(&self.dir, table.name(), state.next_index, "csv");
                state.next_index += 1;
                let file = File::create(&path)
                    .map_err(|e| EtlError::writer(format!("create {}: {e}", path.display())))?;
                state.open.insert(OpenChunk {
                    path,
                    file: BufWriter::new(file),
                    rows: 0,
                    bytes: 0,
                })
            }
        };

        if let Err(e) = chunk.file.write_all(line.as_bytes()) {
            let path = chunk.path.clone();
            state.open = None;
            let _ = std::fs::remove_file(&path);
            return Err(EtlError::writer(format!(
                "write {}: {e}; partial chunk removed",
                path.display()
            )));
        }
        chunk.rows += 1;
        chunk.bytes += line.len() as u64;
        *self.rows_per_table.entry(table.name()).or_insert(0) += 1;

        if chunk.rows >= self.policy.max_rows || chunk.bytes >= self.policy.max_bytes {
            self.close_chunk(table)?;
        }
        Ok(())
    }

    fn close_chunk(&mut self, table: Table) -> Result<()> {
        let Some(state) = self.states.get_mut(&table) else {
            return Ok(());
        };
        let Some(mut chunk) = state.open.take() else {
            return Ok(());
        };
        if let Err(e) = chunk.file.flush() {
            let _ = std::fs::remove_file(&chunk.path);
            return Err(EtlError::writer(format!(
                "flush {}: {e}; partial chunk removed",
                chunk.path.display()
            )));
        }
        debug!(
            table = table.name(),
            path = %chunk.path.display(),
            rows = chunk.rows,
            bytes = chunk.bytes,
            "Finalized CSV chunk"
        );
        self.finished.push(chunk.path);
        Ok(())
    }
}

impl IntermediateWriter for CsvChunkWriter {
    fn write_batches(&mut self, batches: &RowBatches) -> Result<()> {
        for (table, rows) in batches.iter() {
            for row in rows {
                self.write_row(table, row)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<WriterStats> {
        for table in Table::ALL {
            self.close_chunk(table)?;
        }
        Ok(WriterStats {
            rows_per_table: self.rows_per_table.clone(),
            chunks: self.finished.clone(),
        })
    }
}

fn encode_row(row: &[Field]) -> Result<String> {
    let mut out = String::with_capacity(64);
    for (i, field) in row.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_field(field, &mut out)?;
    }
    out.push('\n');
    Ok(out)
}

fn encode_field(field: &Field, out: &mut String) -> Result<()> {
    match field {
        Field::Null => out.push_str("\\N"),
        Field::Bool(true) => out.push('t'),
        Field::Bool(false) => out.push('f'),
        Field::Int(value) => out.push_str(&value.to_string()),
        Field::Uuid(value) => out.push_str(&value.to_string()),
        Field::Date(value) => out.push_str(&value.format("%Y-%m-%d").to_string()),
        Field::Timestamp(value) => {
            out.push_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
        }
        Field::Text(value) => encode_text(value, out),
        Field::Json(value) => {
            let serialized = serde_json::to_string(value)?;
            encode_text(&serialized, out);
        }
    }
    Ok(())
}

fn encode_text(value: &str, out: &mut String) {
    // A bare backslash-N would read back as NULL, so it gets quoted too.
    let needs_quoting =
        value == "\\N" || value.contains([',', '"', '\n', '\r']);
    if !needs_quoting {
        out.push_str(value);
        return;
    }
    out.push('"');
    for c in value.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    fn encode(field: Field) -> String {
        let mut out = String::new();
        encode_field(&field, &mut out).unwrap();
        out
    }

    #[test]
    fn test_scalar_encoding() {
        assert_eq!(encode(Field::Null), "\\N");
        assert_eq!(encode(Field::Bool(true)), "t");
        assert_eq!(encode(Field::Bool(false)), "f");
        assert_eq!(encode(Field::Int(-42)), "-42");
        assert_eq!(
            encode(Field::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())),
            "2024-01-15"
        );
    }

    #[test]
    fn test_timestamp_is_rfc3339_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap();
        assert_eq!(encode(Field::Timestamp(ts)), "2024-06-01T12:30:45.000000Z");
    }

    #[test]
    fn test_text_quoting() {
        assert_eq!(encode(Field::Text("plain".into())), "plain");
        assert_eq!(encode(Field::Text("a,b".into())), "\"a,b\"");
        assert_eq!(encode(Field::Text("say \"hi\"".into())), "\"say \"\"hi\"\"\"");
        assert_eq!(encode(Field::Text("line1\nline2".into())), "\"line1\nline2\"");
        // A literal backslash-N must not read back as NULL
        assert_eq!(encode(Field::Text("\\N".into())), "\"\\N\"");
    }

    #[test]
    fn test_json_is_serialized_then_escaped() {
        let value = serde_json::json!({"name": "a,b", "n": 1});
        let encoded = encode(Field::Json(value));
        assert!(encoded.starts_with('"'));
        assert!(encoded.contains("\"\"name\"\""));
    }

    #[test]
    fn test_chunk_rotation_by_rows() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ChunkPolicy {
            max_rows: 2,
            max_bytes: u64::MAX,
        };
        let mut writer = CsvChunkWriter::new(dir.path(), policy);

        let mut batches = RowBatches::new();
        for i in 0..5 {
            batches.push(
                Table::ProductNdcs,
                vec![Field::Uuid(Uuid::nil()), Field::Text(format!("ndc-{i}"))],
            );
        }
        writer.write_batches(&batches).unwrap();
        let stats = writer.finish().unwrap();

        assert_eq!(stats.total_rows(), 5);
        assert_eq!(stats.chunks.len(), 3);
        assert!(stats.chunks[0].ends_with("product_ndcs.0000.csv"));
        assert!(stats.chunks[2].ends_with("product_ndcs.0002.csv"));

        let first = std::fs::read_to_string(&stats.chunks[0]).unwrap();
        assert_eq!(first.lines().count(), 2);
        let last = std::fs::read_to_string(&stats.chunks[2]).unwrap();
        assert_eq!(last.lines().count(), 1);
    }

    #[test]
    fn test_chunk_rotation_by_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ChunkPolicy {
            max_rows: usize::MAX,
            max_bytes: 10,
        };
        let mut writer = CsvChunkWriter::new(dir.path(), policy);

        let mut batches = RowBatches::new();
        for _ in 0..3 {
            batches.push(
                Table::ProductNdcs,
                vec![Field::Uuid(Uuid::nil()), Field::Text("0002-1433-80".into())],
            );
        }
        writer.write_batches(&batches).unwrap();
        let stats = writer.finish().unwrap();

        // Every row exceeds the byte budget on its own, one chunk per row
        assert_eq!(stats.chunks.len(), 3);
    }

    #[test]
    fn test_rows_land_in_per_table_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvChunkWriter::new(dir.path(), ChunkPolicy::default());

        let mut batches = RowBatches::new();
        batches.push(
            Table::ProductNdcs,
            vec![Field::Uuid(Uuid::nil()), Field::Text("0002-1433-80".into())],
        );
        batches.push(
            Table::MarketingStatus,
            vec![
                Field::Uuid(Uuid::nil()),
                Field::Text("active".into()),
                Field::Date(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()),
                Field::Null,
            ],
        );
        writer.write_batches(&batches).unwrap();
        let stats = writer.finish().unwrap();

        assert_eq!(stats.chunks.len(), 2);
        let marketing = stats
            .chunks
            .iter()
            .find(|p| p.to_string_lossy().contains("marketing_status"))
            .unwrap();
        let content = std::fs::read_to_string(marketing).unwrap();
        assert_eq!(
            content,
            "00000000-0000-0000-0000-000000000000,active,2020-03-01,\\N\n"
        );
    }
}
