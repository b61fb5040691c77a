//! Chunked intermediate files, the wire format between ETL and loader.
//!
//! The writer owns one open file per (table, chunk). A chunk closes and the
//! next one opens when the row count reaches `max_rows` or the byte size
//! reaches `max_bytes`. Files are named `<table>.<NNNN>.<ext>` under the
//! run-scoped staging directory and must stay byte-stable: the loader
//! ingests them through the target's native bulk path.

pub mod csv;
pub mod parquet;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use spl_common::Result;

use crate::config::IntermediateFormat;
use crate::model::RowBatches;

/// Chunk rotation thresholds
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub max_rows: usize,
    pub max_bytes: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_rows: crate::config::DEFAULT_CHUNK_SIZE,
            max_bytes: crate::config::DEFAULT_CHUNK_BYTES,
        }
    }
}

/// Totals reported when a writer finishes
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    /// Rows written per table name
    pub rows_per_table: BTreeMap<&'static str, u64>,
    /// Finalized chunk files, in creation order
    pub chunks: Vec<PathBuf>,
}

impl WriterStats {
    pub fn total_rows(&self) -> u64 {
        self.rows_per_table.values().sum()
    }
}

/// Sink for transformed row batches.
///
/// `write_batches` appends every row of one document before returning, so a
/// caller serializing writers behind a lock gets per-document atomicity in
/// the chunk files. On a write error the implementation deletes the open
/// partial chunk for the affected table; previously finalized chunks remain
/// for inspection.
pub trait IntermediateWriter: Send {
    fn write_batches(&mut self, batches: &RowBatches) -> Result<()>;

    /// Close all open chunks and report totals
    fn finish(&mut self) -> Result<WriterStats>;
}

/// Create a writer for the configured format, creating `dir` if needed
pub fn create_writer(
    format: IntermediateFormat,
    dir: &Path,
    policy: ChunkPolicy,
) -> Result<Box<dyn IntermediateWriter>> {
    std::fs::create_dir_all(dir)?;
    match format {
        IntermediateFormat::Csv => Ok(Box::new(csv::CsvChunkWriter::new(dir, policy))),
        IntermediateFormat::Parquet => Ok(Box::new(parquet::ParquetChunkWriter::new(dir, policy))),
    }
}

/// `<table>.<NNNN>.<ext>` chunk file path
pub(crate) fn chunk_path(dir: &Path, table: &str, index: u32, ext: &str) -> PathBuf {
    dir.join(format!("{table}.{index:04}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_path_naming() {
        let path = chunk_path(Path::new("/tmp/run"), "products", 7, "csv");
        assert_eq!(path, PathBuf::from("/tmp/run/products.0007.csv"));
    }
}
