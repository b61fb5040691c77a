//! PostgreSQL reference loader.
//!
//! Bulk ingest goes through `COPY ... FROM STDIN` (the native path); Parquet
//! chunks are converted to the COPY CSV dialect on the fly. Publication is
//! the swap strategy for FULL loads (TRUNCATE + INSERT in one transaction)
//! and delete-then-insert keyed by `document_id` for DELTA loads, with the
//! `is_latest_version` flag recomputed set-based for every affected lineage
//! inside the same transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field as ParquetCell;
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use spl_common::{EtlError, Result};

use super::{ProcessedArchive, RunHandle, WarehouseLoader};
use crate::config::DbSettings;
use crate::model::{LoadMode, RunStatus, Table};

/// Production DDL plus matching staging tables and run tracking, all
/// idempotent.
const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS spl_raw_documents (
    document_id     UUID PRIMARY KEY,
    set_id          UUID NOT NULL,
    version_number  INTEGER NOT NULL,
    effective_time  DATE NOT NULL,
    raw_data        JSONB,
    source_filename TEXT,
    loaded_at       TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS products (
    document_id             UUID PRIMARY KEY REFERENCES spl_raw_documents (document_id),
    set_id                  UUID NOT NULL,
    version_number          INTEGER NOT NULL,
    effective_time          DATE NOT NULL,
    product_name            TEXT,
    manufacturer_name       TEXT,
    dosage_form             TEXT,
    route_of_administration TEXT,
    is_latest_version       BOOLEAN NOT NULL DEFAULT FALSE,
    loaded_at               TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS product_ndcs (
    surrogate_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    document_id  UUID NOT NULL REFERENCES products (document_id),
    ndc_code     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingredients (
    surrogate_id         BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    document_id          UUID NOT NULL REFERENCES products (document_id),
    ingredient_name      TEXT,
    substance_code       TEXT,
    strength_numerator   TEXT,
    strength_denominator TEXT,
    unit_of_measure      TEXT,
    is_active_ingredient BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS packaging (
    surrogate_id        BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    document_id         UUID NOT NULL REFERENCES products (document_id),
    package_ndc         TEXT,
    package_description TEXT,
    package_type        TEXT
);

CREATE TABLE IF NOT EXISTS marketing_status (
    surrogate_id       BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    document_id        UUID NOT NULL REFERENCES products (document_id),
    marketing_category TEXT,
    start_date         DATE,
    end_date           DATE
);

CREATE INDEX IF NOT EXISTS idx_products_set_id ON products (set_id);
CREATE INDEX IF NOT EXISTS idx_product_ndcs_document_id ON product_ndcs (document_id);
CREATE INDEX IF NOT EXISTS idx_product_ndcs_ndc_code ON product_ndcs (ndc_code);
CREATE INDEX IF NOT EXISTS idx_ingredients_document_id ON ingredients (document_id);
CREATE INDEX IF NOT EXISTS idx_packaging_document_id ON packaging (document_id);
CREATE INDEX IF NOT EXISTS idx_marketing_status_document_id ON marketing_status (document_id);

CREATE TABLE IF NOT EXISTS spl_raw_documents_staging (
    document_id     UUID,
    set_id          UUID,
    version_number  INTEGER,
    effective_time  DATE,
    raw_data        JSONB,
    source_filename TEXT
);

CREATE TABLE IF NOT EXISTS products_staging (
    document_id             UUID,
    set_id                  UUID,
    version_number          INTEGER,
    effective_time          DATE,
    product_name            TEXT,
    manufacturer_name       TEXT,
    dosage_form             TEXT,
    route_of_administration TEXT,
    is_latest_version       BOOLEAN
);

CREATE TABLE IF NOT EXISTS product_ndcs_staging (
    document_id UUID,
    ndc_code    TEXT
);

CREATE TABLE IF NOT EXISTS ingredients_staging (
    document_id          UUID,
    ingredient_name      TEXT,
    substance_code       TEXT,
    strength_numerator   TEXT,
    strength_denominator TEXT,
    unit_of_measure      TEXT,
    is_active_ingredient BOOLEAN
);

CREATE TABLE IF NOT EXISTS packaging_staging (
    document_id         UUID,
    package_ndc         TEXT,
    package_description TEXT,
    package_type        TEXT
);

CREATE TABLE IF NOT EXISTS marketing_status_staging (
    document_id        UUID,
    marketing_category TEXT,
    start_date         DATE,
    end_date           DATE
);

CREATE TABLE IF NOT EXISTS etl_load_history (
    run_id             BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    start_time         TIMESTAMPTZ NOT NULL,
    end_time           TIMESTAMPTZ,
    status             TEXT NOT NULL,
    mode               TEXT NOT NULL,
    archives_processed INTEGER NOT NULL DEFAULT 0,
    records_loaded     BIGINT NOT NULL DEFAULT 0,
    error_log          TEXT
);

CREATE TABLE IF NOT EXISTS etl_processed_archives (
    archive_name        TEXT PRIMARY KEY,
    archive_checksum    TEXT NOT NULL,
    processed_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Recompute `is_latest_version` for every lineage touched by this merge:
/// highest version wins, ties broken by latest effective time, then by the
/// lexicographically greatest document id.
const LATEST_VERSION_SQL: &str = r#"
WITH affected AS (
    SELECT DISTINCT set_id FROM products_staging
),
ranked AS (
    SELECT document_id,
           ROW_NUMBER() OVER (
               PARTITION BY set_id
               ORDER BY version_number DESC, effective_time DESC, document_id DESC
           ) AS rn
    FROM products
    WHERE set_id IN (SELECT set_id FROM affected)
)
UPDATE products
SET is_latest_version = (ranked.rn = 1)
FROM ranked
WHERE products.document_id = ranked.document_id
"#;

const LEDGER_UPSERT_SQL: &str = r#"
INSERT INTO etl_processed_archives (archive_name, archive_checksum, processed_timestamp)
VALUES ($1, $2, now())
ON CONFLICT (archive_name) DO UPDATE SET
    archive_checksum    = EXCLUDED.archive_checksum,
    processed_timestamp = EXCLUDED.processed_timestamp
"#;

/// PostgreSQL implementation of the loader contract
pub struct PostgresLoader {
    pool: PgPool,
    optimize_full_load: bool,
    /// DDL to replay in `post_load_cleanup`, recorded by
    /// `pre_load_optimization` (indexes first, then FKs)
    dropped_objects: Mutex<Vec<String>>,
}

impl PostgresLoader {
    /// Connect a pooled loader using the configured settings
    pub async fn connect(settings: &DbSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.connection_url())
            .await?;
        info!(
            host = %settings.host,
            database = %settings.name,
            max_connections = settings.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self::from_pool_with_options(
            pool,
            settings.optimize_full_load,
        ))
    }

    /// Wrap an existing pool (tests, embedding applications)
    pub fn from_pool(pool: PgPool) -> Self {
        Self::from_pool_with_options(pool, true)
    }

    fn from_pool_with_options(pool: PgPool, optimize_full_load: bool) -> Self {
        Self {
            pool,
            optimize_full_load,
            dropped_objects: Mutex::new(Vec::new()),
        }
    }

    async fn truncate_staging_tables(&self) -> Result<()> {
        for table in Table::ALL {
            sqlx::query(&format!("TRUNCATE TABLE {}_staging", table.name()))
                .execute(&self.pool)
                .await
                .map_err(db_err("truncate staging", EtlError::Staging))?;
        }
        Ok(())
    }

    async fn copy_chunk(&self, table: Table, path: &Path) -> Result<u64> {
        let columns = table.columns().join(", ");
        let statement = format!(
            "COPY {}_staging ({columns}) FROM STDIN WITH (FORMAT csv, DELIMITER ',', QUOTE '\"', NULL '\\N')",
            table.name()
        );

        let mut copy = self
            .pool
            .copy_in_raw(&statement)
            .await
            .map_err(db_err("open COPY stream", EtlError::Staging))?;

        let is_parquet = path.extension().and_then(|e| e.to_str()) == Some("parquet");
        let send_result = if is_parquet {
            let owned = path.to_path_buf();
            let csv = tokio::task::spawn_blocking(move || parquet_chunk_to_csv(&owned, table))
                .await
                .map_err(|e| EtlError::staging(format!("parquet conversion task: {e}")))??;
            copy.send(csv).await.map(|_| ())
        } else {
            stream_file_into_copy(path, &mut copy).await
        };

        if let Err(e) = send_result {
            let _ = copy.abort("chunk ingest failed").await;
            return Err(EtlError::staging(format!(
                "COPY {} from {}: {e}",
                table.name(),
                path.display()
            )));
        }

        let rows = copy
            .finish()
            .await
            .map_err(db_err("finish COPY stream", EtlError::Staging))?;
        debug!(table = table.name(), path = %path.display(), rows, "Staged chunk");
        Ok(rows)
    }

    async fn check_integrity(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        for child in Table::CHILDREN {
            let orphans: i64 = sqlx::query_scalar(&format!(
                "SELECT count(*) FROM {child} c LEFT JOIN products p \
                 ON p.document_id = c.document_id WHERE p.document_id IS NULL",
                child = child.name()
            ))
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err("integrity check", EtlError::Merge))?;
            if orphans > 0 {
                return Err(EtlError::integrity(format!(
                    "{orphans} orphan rows in {} after merge",
                    child.name()
                )));
            }
        }

        let missing_raw: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM products p LEFT JOIN spl_raw_documents r \
             ON r.document_id = p.document_id WHERE r.document_id IS NULL",
        )
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err("integrity check", EtlError::Merge))?;
        if missing_raw > 0 {
            return Err(EtlError::integrity(format!(
                "{missing_raw} products rows without a spl_raw_documents row"
            )));
        }

        let bad_lineages: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM ( \
                 SELECT set_id FROM products GROUP BY set_id \
                 HAVING count(*) FILTER (WHERE is_latest_version) <> 1 \
             ) bad",
        )
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err("integrity check", EtlError::Merge))?;
        if bad_lineages > 0 {
            return Err(EtlError::integrity(format!(
                "{bad_lineages} lineages without exactly one latest version"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WarehouseLoader for PostgresLoader {
    async fn initialize_schema(&self) -> Result<()> {
        info!("Initializing PostgreSQL schema");
        sqlx::raw_sql(SCHEMA_DDL).execute(&self.pool).await?;
        info!("Schema initialization complete");
        Ok(())
    }

    async fn recover_crashed_runs(&self, stale_after: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE etl_load_history \
             SET status = 'FAILED', end_time = now(), error_log = 'crashed' \
             WHERE status = 'RUNNING' AND end_time IS NULL \
               AND start_time < now() - make_interval(secs => $1)",
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Marked stale RUNNING history rows as crashed");
        }
        Ok(recovered)
    }

    async fn start_run(&self, mode: LoadMode) -> Result<RunHandle> {
        // Single RUNNING-row guard: concurrent runs share staging tables and
        // are not supported.
        let running: Option<i64> = sqlx::query_scalar(
            "SELECT run_id FROM etl_load_history WHERE status = 'RUNNING' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some(run_id) = running {
            return Err(EtlError::ConcurrentRun { run_id });
        }

        let started_at = Utc::now();
        let run_id: i64 = sqlx::query_scalar(
            "INSERT INTO etl_load_history (start_time, status, mode) \
             VALUES ($1, 'RUNNING', $2) RETURNING run_id",
        )
        .bind(started_at)
        .bind(mode.as_str())
        .fetch_one(&self.pool)
        .await?;

        info!(run_id, mode = %mode, "Load run started");
        Ok(RunHandle { run_id, started_at })
    }

    async fn get_processed_archives(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT archive_name, archive_checksum FROM etl_processed_archives")
            .fetch_all(&self.pool)
            .await?;
        let mut processed = HashMap::with_capacity(rows.len());
        for row in rows {
            processed.insert(
                row.try_get::<String, _>("archive_name")?,
                row.try_get::<String, _>("archive_checksum")?,
            );
        }
        debug!(count = processed.len(), "Fetched processed-archive ledger");
        Ok(processed)
    }

    async fn pre_load_optimization(&self, mode: LoadMode) -> Result<()> {
        if mode != LoadMode::Full || !self.optimize_full_load {
            debug!(mode = %mode, "Skipping index/FK drop");
            return Ok(());
        }

        let tables: Vec<String> = Table::ALL.iter().map(|t| t.name().to_string()).collect();

        // Capture recreation DDL before dropping anything.
        let fk_defs: Vec<String> = sqlx::query_scalar(
            "SELECT 'ALTER TABLE ' || quote_ident(n.nspname) || '.' || quote_ident(rel.relname) \
                 || ' ADD CONSTRAINT ' || quote_ident(c.conname) || ' ' || pg_get_constraintdef(c.oid) \
             FROM pg_constraint c \
             JOIN pg_class rel ON rel.oid = c.conrelid \
             JOIN pg_namespace n ON n.oid = rel.relnamespace \
             WHERE c.contype = 'f' AND rel.relname = ANY($1)",
        )
        .bind(&tables)
        .fetch_all(&self.pool)
        .await?;

        let index_defs: Vec<String> = sqlx::query_scalar(
            "SELECT indexdef FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = ANY($1) \
               AND indexname NOT LIKE '%_pkey'",
        )
        .bind(&tables)
        .fetch_all(&self.pool)
        .await?;

        let fk_drops: Vec<String> = sqlx::query_scalar(
            "SELECT 'ALTER TABLE ' || quote_ident(n.nspname) || '.' || quote_ident(rel.relname) \
                 || ' DROP CONSTRAINT ' || quote_ident(c.conname) \
             FROM pg_constraint c \
             JOIN pg_class rel ON rel.oid = c.conrelid \
             JOIN pg_namespace n ON n.oid = rel.relnamespace \
             WHERE c.contype = 'f' AND rel.relname = ANY($1)",
        )
        .bind(&tables)
        .fetch_all(&self.pool)
        .await?;

        let index_drops: Vec<String> = sqlx::query_scalar(
            "SELECT format('DROP INDEX IF EXISTS %I', indexname) FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = ANY($1) \
               AND indexname NOT LIKE '%_pkey'",
        )
        .bind(&tables)
        .fetch_all(&self.pool)
        .await?;

        info!(
            foreign_keys = fk_drops.len(),
            indexes = index_drops.len(),
            "Dropping constraints and indexes for full load"
        );
        for statement in fk_drops.iter().chain(index_drops.iter()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // Recreate indexes before the FKs that may depend on them.
        let mut dropped = self.dropped_objects.lock().await;
        dropped.clear();
        dropped.extend(index_defs);
        dropped.extend(fk_defs);
        Ok(())
    }

    async fn bulk_load_to_staging(&self, dir: &Path) -> Result<u64> {
        self.truncate_staging_tables().await?;

        let mut chunks: Vec<(Table, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some((table, _)) = parse_chunk_name(&path) {
                chunks.push((table, path));
            }
        }
        if chunks.is_empty() {
            warn!(dir = %dir.display(), "No intermediate chunk files to stage");
            return Ok(0);
        }
        chunks.sort_by(|a, b| a.1.cmp(&b.1));

        let mut total = 0u64;
        for (table, path) in &chunks {
            match self.copy_chunk(*table, path).await {
                Ok(rows) => total += rows,
                Err(e) => {
                    // Leave staging empty for the retry.
                    if let Err(truncate_err) = self.truncate_staging_tables().await {
                        warn!(error = %truncate_err, "Failed to truncate staging after load error");
                    }
                    return Err(e);
                }
            }
        }
        info!(chunks = chunks.len(), rows = total, "Bulk load to staging complete");
        Ok(total)
    }

    async fn merge_from_staging(
        &self,
        mode: LoadMode,
        archives: &[ProcessedArchive],
        loaded_at: DateTime<Utc>,
    ) -> Result<()> {
        info!(mode = %mode, archives = archives.len(), "Merging staging into production");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("begin merge transaction", EtlError::Merge))?;

        match mode {
            LoadMode::Full => {
                // Swap strategy: one TRUNCATE covering the whole FK graph,
                // then rebuild parents-first from staging.
                sqlx::query(
                    "TRUNCATE TABLE marketing_status, packaging, ingredients, \
                     product_ndcs, products, spl_raw_documents",
                )
                .execute(&mut *tx)
                .await
                .map_err(db_err("truncate production", EtlError::Merge))?;
            }
            LoadMode::Delta => {
                // Replace whole documents: children out first, then parents.
                for child in Table::CHILDREN {
                    sqlx::query(&format!(
                        "DELETE FROM {child} WHERE document_id IN \
                         (SELECT document_id FROM products_staging)",
                        child = child.name()
                    ))
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err("delete child rows", EtlError::Merge))?;
                }
                sqlx::query(
                    "DELETE FROM products WHERE document_id IN \
                     (SELECT document_id FROM products_staging)",
                )
                .execute(&mut *tx)
                .await
                .map_err(db_err("delete products rows", EtlError::Merge))?;
                sqlx::query(
                    "DELETE FROM spl_raw_documents WHERE document_id IN \
                     (SELECT document_id FROM spl_raw_documents_staging)",
                )
                .execute(&mut *tx)
                .await
                .map_err(db_err("delete raw document rows", EtlError::Merge))?;
            }
        }

        for table in Table::ALL {
            let with_loaded_at = matches!(table, Table::SplRawDocuments | Table::Products);
            let statement = insert_select_sql(table, with_loaded_at);
            let query = sqlx::query(&statement);
            let query = if with_loaded_at {
                query.bind(loaded_at)
            } else {
                query
            };
            query
                .execute(&mut *tx)
                .await
                .map_err(db_err("insert from staging", EtlError::Merge))?;
        }

        sqlx::query(LATEST_VERSION_SQL)
            .execute(&mut *tx)
            .await
            .map_err(db_err("recompute is_latest_version", EtlError::Merge))?;

        self.check_integrity(&mut tx).await?;

        // Ledger rows commit atomically with the data they describe, so a
        // partially merged batch is never marked processed.
        for archive in archives {
            sqlx::query(LEDGER_UPSERT_SQL)
                .bind(&archive.name)
                .bind(&archive.checksum)
                .execute(&mut *tx)
                .await
                .map_err(db_err("record processed archive", EtlError::Merge))?;
        }

        for table in Table::ALL {
            sqlx::query(&format!("TRUNCATE TABLE {}_staging", table.name()))
                .execute(&mut *tx)
                .await
                .map_err(db_err("truncate staging", EtlError::Merge))?;
        }

        tx.commit()
            .await
            .map_err(db_err("commit merge transaction", EtlError::Merge))?;
        info!(mode = %mode, "Merge committed");
        Ok(())
    }

    async fn post_load_cleanup(&self, mode: LoadMode) -> Result<()> {
        let dropped = {
            let mut guard = self.dropped_objects.lock().await;
            std::mem::take(&mut *guard)
        };
        if !dropped.is_empty() {
            info!(objects = dropped.len(), "Recreating dropped indexes and constraints");
            for statement in &dropped {
                if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                    warn!(statement = %statement, error = %e, "Failed to recreate object");
                }
            }
        }

        // Refresh planner statistics; VACUUM cannot run inside a
        // transaction block, so this goes through the simple protocol.
        if let Err(e) = sqlx::raw_sql("VACUUM (ANALYZE)").execute(&self.pool).await {
            warn!(mode = %mode, error = %e, "VACUUM ANALYZE failed");
        }
        Ok(())
    }

    async fn record_processed_archive(&self, archive: &ProcessedArchive) -> Result<()> {
        sqlx::query(LEDGER_UPSERT_SQL)
            .bind(&archive.name)
            .bind(&archive.checksum)
            .execute(&self.pool)
            .await?;
        info!(archive = %archive.name, "Recorded processed archive");
        Ok(())
    }

    async fn end_run(
        &self,
        run_id: i64,
        status: RunStatus,
        archives_processed: u32,
        records_loaded: u64,
        error_log: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE etl_load_history \
             SET end_time = now(), status = $1, archives_processed = $2, \
                 records_loaded = $3, error_log = $4 \
             WHERE run_id = $5",
        )
        .bind(status.as_str())
        .bind(archives_processed as i32)
        .bind(records_loaded as i64)
        .bind(error_log)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        info!(run_id, status = status.as_str(), records_loaded, "Load run closed");
        Ok(())
    }
}

/// `INSERT INTO <table> (...) SELECT ... FROM <table>_staging`, optionally
/// stamping `loaded_at` from the bound run timestamp
fn insert_select_sql(table: Table, with_loaded_at: bool) -> String {
    let columns = table.columns().join(", ");
    if with_loaded_at {
        format!(
            "INSERT INTO {table} ({columns}, loaded_at) SELECT {columns}, $1 FROM {table}_staging",
            table = table.name()
        )
    } else {
        format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM {table}_staging",
            table = table.name()
        )
    }
}

/// Recognize `<table>.<NNNN>.<csv|parquet>` chunk files
fn parse_chunk_name(path: &Path) -> Option<(Table, u32)> {
    let file_name = path.file_name()?.to_str()?;
    let mut parts = file_name.rsplitn(3, '.');
    let ext = parts.next()?;
    if ext != "csv" && ext != "parquet" {
        return None;
    }
    let index: u32 = parts.next()?.parse().ok()?;
    let table = Table::from_name(parts.next()?)?;
    Some((table, index))
}

/// Stream a chunk file into an open COPY in fixed-size blocks
async fn stream_file_into_copy(
    path: &Path,
    copy: &mut sqlx::postgres::PgCopyIn<sqlx::pool::PoolConnection<Postgres>>,
) -> std::result::Result<(), sqlx::Error> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await.map_err(sqlx::Error::Io)?;
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buf).await.map_err(sqlx::Error::Io)?;
        if read == 0 {
            return Ok(());
        }
        copy.send(&buf[..read]).await?;
    }
}

/// Convert one Parquet chunk to the COPY CSV dialect
fn parquet_chunk_to_csv(path: &Path, table: Table) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let reader = SerializedFileReader::new(file)
        .map_err(|e| EtlError::staging(format!("open parquet chunk {}: {e}", path.display())))?;

    let mut out = Vec::new();
    let rows = reader
        .get_row_iter(None)
        .map_err(|e| EtlError::staging(format!("read parquet chunk {}: {e}", path.display())))?;
    for row in rows {
        let row =
            row.map_err(|e| EtlError::staging(format!("parquet row in {}: {e}", path.display())))?;
        let mut first = true;
        for (_, cell) in row.get_column_iter() {
            if !first {
                out.push(b',');
            }
            first = false;
            match cell {
                ParquetCell::Null => out.extend_from_slice(b"\\N"),
                ParquetCell::Bool(v) => out.push(if *v { b't' } else { b'f' }),
                ParquetCell::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
                ParquetCell::Long(v) => out.extend_from_slice(v.to_string().as_bytes()),
                ParquetCell::Date(days) => {
                    let date = NaiveDate::from_ymd_opt(1970, 1, 1)
                        .and_then(|epoch| {
                            epoch.checked_add_signed(chrono::Duration::days(*days as i64))
                        })
                        .ok_or_else(|| {
                            EtlError::staging(format!("out-of-range date in {}", path.display()))
                        })?;
                    out.extend_from_slice(date.format("%Y-%m-%d").to_string().as_bytes());
                }
                ParquetCell::Str(s) => append_csv_text(s, &mut out),
                other => {
                    return Err(EtlError::staging(format!(
                        "unexpected parquet value {other:?} in {} chunk {}",
                        table.name(),
                        path.display()
                    )));
                }
            }
        }
        out.push(b'\n');
    }
    Ok(out)
}

fn append_csv_text(value: &str, out: &mut Vec<u8>) {
    let needs_quoting = value == "\\N" || value.contains([',', '"', '\n', '\r']);
    if !needs_quoting {
        out.extend_from_slice(value.as_bytes());
        return;
    }
    out.push(b'"');
    for byte in value.bytes() {
        if byte == b'"' {
            out.push(b'"');
        }
        out.push(byte);
    }
    out.push(b'"');
}

/// Classify a sqlx error: transient conditions keep their source for the
/// retry policy, everything else is wrapped in the stage-specific kind.
fn db_err(
    operation: &'static str,
    wrap: fn(String) -> EtlError,
) -> impl Fn(sqlx::Error) -> EtlError {
    move |e| {
        if matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) {
            EtlError::TransientDb {
                operation: operation.to_string(),
                source: e,
            }
        } else {
            wrap(format!("{operation}: {e}"))
        }
    }
}
