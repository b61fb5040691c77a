//! The pluggable warehouse loader contract.
//!
//! A loader maps staged intermediate files into one warehouse through its
//! native bulk-ingest path with atomic publication, versioning, idempotency,
//! and delta tracking. Implementations write to this contract, not to any
//! host framework; the registry resolves a configured adapter name to an
//! implementation.
//!
//! Within a run the operations are called in order: `start_run`,
//! `get_processed_archives`, then per batch `pre_load_optimization` (first
//! batch only), `bulk_load_to_staging`, `merge_from_staging`, and finally
//! `post_load_cleanup` and `end_run`.

pub mod postgres;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use spl_common::{EtlError, Result};

use crate::config::Settings;
use crate::model::{LoadMode, RunStatus};

/// Maximum attempts for an operation hitting transient database errors
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// First retry delay; doubled per attempt up to [`MAX_RETRY_DELAY`]
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the exponential retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Identity of an archive in the processed ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedArchive {
    /// Source filename of the archive
    pub name: String,
    /// Hex SHA-256 of the archive bytes
    pub checksum: String,
}

/// Open row in `etl_load_history`
#[derive(Debug, Clone, Copy)]
pub struct RunHandle {
    pub run_id: i64,
    /// Run timestamp; the loader stamps `loaded_at` with this single value
    pub started_at: DateTime<Utc>,
}

/// Warehouse loader contract.
///
/// Every operation is synchronous from the pipeline's point of view and may
/// be called only in the documented order within a run. Staging tables are
/// exclusive to one loader instance; the RUNNING-row guard in `start_run`
/// rejects concurrent runs against the same target.
#[async_trait]
pub trait WarehouseLoader: Send + Sync {
    /// Create all production, staging, and tracking tables idempotently
    async fn initialize_schema(&self) -> Result<()>;

    /// Mark RUNNING history rows older than `stale_after` as FAILED
    /// ("crashed"); returns how many were flipped.
    async fn recover_crashed_runs(&self, stale_after: Duration) -> Result<u64>;

    /// Insert a RUNNING history row and return its handle.
    ///
    /// Fails with [`EtlError::ConcurrentRun`] while another RUNNING row
    /// exists.
    async fn start_run(&self, mode: LoadMode) -> Result<RunHandle>;

    /// Archive names already marked processed, with their checksums
    async fn get_processed_archives(&self) -> Result<HashMap<String, String>>;

    /// FULL mode may drop non-PK indexes and disable FKs on production
    /// tables to accelerate the merge; DELTA is a no-op. Reversed by
    /// `post_load_cleanup`.
    async fn pre_load_optimization(&self, mode: LoadMode) -> Result<()>;

    /// Truncate staging tables, then ingest every chunk file under `dir`
    /// through the target's native bulk path. Returns total staged rows.
    async fn bulk_load_to_staging(&self, dir: &Path) -> Result<u64>;

    /// Atomic publication of staging into production, one transaction per
    /// table group: merge rows, recompute `is_latest_version` for affected
    /// lineages, verify invariants, write ledger rows for `archives`, and
    /// truncate staging. Readers never observe a partial state.
    async fn merge_from_staging(
        &self,
        mode: LoadMode,
        archives: &[ProcessedArchive],
        loaded_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Rebuild anything dropped in pre-load and refresh planner statistics.
    /// Failures are non-fatal and logged as warnings.
    async fn post_load_cleanup(&self, mode: LoadMode) -> Result<()>;

    /// Upsert a single ledger row (compensating path; batched merges write
    /// the ledger inside the merge transaction instead).
    async fn record_processed_archive(&self, archive: &ProcessedArchive) -> Result<()>;

    /// Close the history row for the run
    async fn end_run(
        &self,
        run_id: i64,
        status: RunStatus,
        archives_processed: u32,
        records_loaded: u64,
        error_log: Option<&str>,
    ) -> Result<()>;
}

/// Resolve the configured `db.adapter` to a loader implementation
pub async fn create_loader(settings: &Settings) -> Result<Arc<dyn WarehouseLoader>> {
    match settings.db.adapter.as_str() {
        "postgres" | "postgresql" => {
            let loader = postgres::PostgresLoader::connect(&settings.db).await?;
            Ok(Arc::new(loader))
        }
        other => Err(EtlError::configuration(format!(
            "unsupported db.adapter '{other}' (available: postgres)"
        ))),
    }
}

/// Run `attempt` with capped exponential backoff on transient database
/// errors, up to [`MAX_RETRY_ATTEMPTS`] attempts. Non-transient errors
/// surface immediately.
pub async fn with_backoff<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_RETRY_DELAY;
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tries < MAX_RETRY_ATTEMPTS => {
                warn!(
                    operation,
                    attempt = tries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn transient() -> EtlError {
        EtlError::TransientDb {
            operation: "test".to_string(),
            source: sqlx::Error::PoolTimedOut,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_backoff_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EtlError::merge("constraint violated")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
