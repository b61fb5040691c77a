//! Pipeline orchestration: the per-archive cycle.
//!
//! parse → transform → write → stage → merge → record, with idempotency
//! across archives via the processed ledger, quarantine-and-continue for
//! malformed files, and cooperative cancellation. Parsing and
//! transformation run on a bounded worker pool; the writer serializes
//! appends behind a mutex so every document's rows land in the chunk files
//! atomically. Staging and merge are strictly sequential in the loader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use spl_common::{EtlError, Result};

use crate::acquisition::{ArchiveSource, SourceArchive};
use crate::archive::extract_zip_archive;
use crate::config::Settings;
use crate::loader::{with_backoff, ProcessedArchive, RunHandle, WarehouseLoader};
use crate::model::{LoadMode, RunStatus};
use crate::parse;
use crate::transform;
use crate::writer::{create_writer, ChunkPolicy, IntermediateWriter};

/// Result of one pipeline run; drives the process exit code
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub run_id: i64,
    pub archives_processed: usize,
    /// Archives skipped because the ledger already records them
    pub archives_skipped: usize,
    pub documents_loaded: u64,
    /// Files moved to quarantine (malformed or conflicting)
    pub documents_failed: u64,
    pub records_staged: u64,
}

impl RunOutcome {
    /// 0 for a clean run, 3 when files were quarantined (partial failure)
    pub fn exit_code(&self) -> i32 {
        if self.documents_failed > 0 {
            3
        } else {
            0
        }
    }
}

/// Per-archive entry in `runs/<run_id>/manifest.json`
#[derive(Debug, Clone, Serialize)]
struct ArchiveManifest {
    name: String,
    checksum: String,
    documents_loaded: u64,
    documents_quarantined: u64,
}

#[derive(Debug, Serialize)]
struct RunManifest {
    run_id: i64,
    mode: String,
    records_staged: u64,
    archives: Vec<ArchiveManifest>,
}

#[derive(Debug, Default)]
struct ArchiveStats {
    loaded: u64,
    quarantined: u64,
}

enum FileOutcome {
    Loaded,
    Quarantined,
}

/// Drives full and delta loads against one loader instance
pub struct Pipeline {
    settings: Settings,
    loader: Arc<dyn WarehouseLoader>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(settings: Settings, loader: Arc<dyn WarehouseLoader>) -> Self {
        Self {
            settings,
            loader,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between files and between archives; setting it makes
    /// the run finish the current file and close as FAILED/canceled.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(EtlError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Execute one run end to end.
    ///
    /// The history row is always closed: SUCCESS with totals, or FAILED with
    /// the error text when anything aborts the run.
    pub async fn run(&self, mode: LoadMode, source: &dyn ArchiveSource) -> Result<RunOutcome> {
        let stale_after = Duration::from_secs(self.settings.stale_run_hours * 3600);
        self.loader.recover_crashed_runs(stale_after).await?;

        let run = self.loader.start_run(mode).await?;
        match self.execute(mode, source, &run).await {
            Ok(outcome) => {
                self.loader
                    .end_run(
                        run.run_id,
                        RunStatus::Success,
                        outcome.archives_processed as u32,
                        outcome.records_staged,
                        None,
                    )
                    .await?;
                info!(
                    run_id = run.run_id,
                    archives = outcome.archives_processed,
                    skipped = outcome.archives_skipped,
                    documents = outcome.documents_loaded,
                    quarantined = outcome.documents_failed,
                    "Run finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(run_id = run.run_id, error = %e, "Run failed");
                if let Err(end_err) = self
                    .loader
                    .end_run(
                        run.run_id,
                        RunStatus::Failed,
                        0,
                        0,
                        Some(&e.to_string()),
                    )
                    .await
                {
                    warn!(run_id = run.run_id, error = %end_err, "Failed to close history row");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        mode: LoadMode,
        source: &dyn ArchiveSource,
        run: &RunHandle,
    ) -> Result<RunOutcome> {
        let run_dir = self
            .settings
            .scratch_path
            .join("runs")
            .join(run.run_id.to_string());
        let staging_dir = run_dir.join("staging");
        let quarantine_root = self
            .settings
            .quarantine_path
            .clone()
            .unwrap_or_else(|| run_dir.join("quarantine"));
        std::fs::create_dir_all(&staging_dir)?;

        let processed = self.loader.get_processed_archives().await?;
        let discovered = source.discover().await?;

        let mut outcome = RunOutcome {
            run_id: run.run_id,
            ..RunOutcome::default()
        };
        let mut to_process: Vec<SourceArchive> = Vec::new();
        for archive in discovered {
            match processed.get(&archive.name) {
                Some(recorded) if *recorded == archive.checksum => {
                    info!(archive = %archive.name, "Already processed, skipping");
                    outcome.archives_skipped += 1;
                }
                Some(_) => {
                    info!(archive = %archive.name, "Checksum changed, reprocessing");
                    to_process.push(archive);
                }
                None => to_process.push(archive),
            }
        }
        if to_process.is_empty() {
            info!("No new archives; warehouse is up to date");
            return Ok(outcome);
        }
        info!(count = to_process.len(), mode = %mode, "Archives to process");

        // FULL rebuilds everything in one publication cycle; DELTA amortizes
        // merge cost over configured batches.
        let batch_size = match mode {
            LoadMode::Full => to_process.len(),
            LoadMode::Delta => self.settings.delta_batch_archives,
        };

        let policy = ChunkPolicy {
            max_rows: self.settings.chunk_size,
            max_bytes: self.settings.chunk_bytes,
        };
        let seen_ids: Arc<StdMutex<HashSet<Uuid>>> = Arc::new(StdMutex::new(HashSet::new()));
        let mut manifest_entries: Vec<ArchiveManifest> = Vec::new();
        let mut first_batch = true;

        for batch in to_process.chunks(batch_size) {
            self.check_cancel()?;

            let writer = Arc::new(StdMutex::new(create_writer(
                self.settings.intermediate_format,
                &staging_dir,
                policy,
            )?));
            let mut batch_archives: Vec<ProcessedArchive> = Vec::new();
            let mut batch_manifest: Vec<ArchiveManifest> = Vec::new();

            for archive in batch {
                self.check_cancel()?;
                info!(archive = %archive.name, "Processing archive");

                let extract_dir = run_dir.join("extract").join(archive_stem(&archive.name));
                let files = extract_zip_archive(&archive.path, &extract_dir)?;
                info!(archive = %archive.name, files = files.len(), "Extracted XML files");

                let quarantine_dir = quarantine_root.join(&archive.name);
                let stats = self
                    .process_files(files, writer.clone(), seen_ids.clone(), &quarantine_dir)
                    .await?;
                outcome.documents_loaded += stats.loaded;
                outcome.documents_failed += stats.quarantined;

                batch_archives.push(ProcessedArchive {
                    name: archive.name.clone(),
                    checksum: archive.checksum.clone(),
                });
                batch_manifest.push(ArchiveManifest {
                    name: archive.name.clone(),
                    checksum: archive.checksum.clone(),
                    documents_loaded: stats.loaded,
                    documents_quarantined: stats.quarantined,
                });
            }
            self.check_cancel()?;

            let writer_stats = {
                let mut guard = writer
                    .lock()
                    .map_err(|_| EtlError::writer("writer lock poisoned"))?;
                guard.finish()?
            };
            let rows_written = writer_stats.total_rows();
            info!(
                rows = rows_written,
                chunks = writer_stats.chunks.len(),
                "Intermediate files finalized"
            );

            if first_batch {
                self.loader.pre_load_optimization(mode).await?;
                first_batch = false;
            }

            let loader = &self.loader;
            let staged =
                with_backoff("bulk_load_to_staging", || loader.bulk_load_to_staging(&staging_dir))
                    .await?;
            if staged != rows_written {
                return Err(EtlError::integrity(format!(
                    "wrote {rows_written} intermediate rows but staged {staged}"
                )));
            }

            with_backoff("merge_from_staging", || {
                loader.merge_from_staging(mode, &batch_archives, run.started_at)
            })
            .await?;

            outcome.records_staged += staged;
            outcome.archives_processed += batch_archives.len();
            manifest_entries.extend(batch_manifest);

            // Intermediate files are only diagnostics once merged.
            for chunk in &writer_stats.chunks {
                let _ = std::fs::remove_file(chunk);
            }
        }

        if let Err(e) = self.loader.post_load_cleanup(mode).await {
            warn!(error = %e, "Post-load cleanup failed");
        }

        let manifest = RunManifest {
            run_id: run.run_id,
            mode: mode.as_str().to_string(),
            records_staged: outcome.records_staged,
            archives: manifest_entries,
        };
        std::fs::write(
            run_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        Ok(outcome)
    }

    /// Parse, transform, and write one archive's files on the worker pool.
    ///
    /// The bounded queue (2× workers) applies backpressure when the writer
    /// cannot keep up; workers never hold unbounded in-memory batches.
    async fn process_files(
        &self,
        files: Vec<(PathBuf, String)>,
        writer: Arc<StdMutex<Box<dyn IntermediateWriter>>>,
        seen_ids: Arc<StdMutex<HashSet<Uuid>>>,
        quarantine_dir: &Path,
    ) -> Result<ArchiveStats> {
        let worker_count = self.settings.worker_count;
        let (tx, rx) = mpsc::channel::<(PathBuf, String)>(worker_count * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let fatal: Arc<StdMutex<Option<EtlError>>> = Arc::new(StdMutex::new(None));

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = rx.clone();
            let writer = writer.clone();
            let seen_ids = seen_ids.clone();
            let fatal = fatal.clone();
            let cancel = self.cancel.clone();
            let quarantine_dir = quarantine_dir.to_path_buf();

            handles.push(tokio::spawn(async move {
                let mut stats = ArchiveStats::default();
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some((path, rel_name)) = next else { break };
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }

                    let writer = writer.clone();
                    let seen_ids = seen_ids.clone();
                    let quarantine_dir = quarantine_dir.clone();
                    let joined = tokio::task::spawn_blocking(move || {
                        process_one_file(&path, &rel_name, &writer, &seen_ids, &quarantine_dir)
                    })
                    .await;

                    match joined {
                        Ok(Ok(FileOutcome::Loaded)) => stats.loaded += 1,
                        Ok(Ok(FileOutcome::Quarantined)) => stats.quarantined += 1,
                        Ok(Err(e)) => {
                            if let Ok(mut slot) = fatal.lock() {
                                slot.get_or_insert(e);
                            }
                            cancel.store(true, Ordering::Relaxed);
                            break;
                        }
                        Err(join_err) => {
                            if let Ok(mut slot) = fatal.lock() {
                                slot.get_or_insert(EtlError::writer(format!(
                                    "worker task failed: {join_err}"
                                )));
                            }
                            cancel.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
                stats
            }));
        }

        for item in files {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if tx.send(item).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut totals = ArchiveStats::default();
        for handle in handles {
            let stats = handle
                .await
                .map_err(|e| EtlError::writer(format!("worker join failed: {e}")))?;
            totals.loaded += stats.loaded;
            totals.quarantined += stats.quarantined;
        }

        if let Some(e) = fatal
            .lock()
            .map_err(|_| EtlError::writer("error slot poisoned"))?
            .take()
        {
            return Err(e);
        }
        Ok(totals)
    }
}

/// One file, end to end: parse, duplicate check, transform, write.
///
/// Malformed files and `document_id` conflicts are quarantined and the run
/// continues; writer errors surface as fatal.
fn process_one_file(
    path: &Path,
    rel_name: &str,
    writer: &StdMutex<Box<dyn IntermediateWriter>>,
    seen_ids: &StdMutex<HashSet<Uuid>>,
    quarantine_dir: &Path,
) -> Result<FileOutcome> {
    match parse::parse_file(path, rel_name) {
        Ok(doc) => {
            let is_new = seen_ids
                .lock()
                .map_err(|_| EtlError::writer("document id set poisoned"))?
                .insert(doc.document_id);
            if !is_new {
                warn!(
                    file = rel_name,
                    document_id = %doc.document_id,
                    "Duplicate document_id, quarantining as conflict"
                );
                quarantine_file(path, quarantine_dir)?;
                return Ok(FileOutcome::Quarantined);
            }

            let batches = transform::transform(&doc);
            // One lock scope per document keeps its rows contiguous and
            // complete in the chunk files.
            let mut guard = writer
                .lock()
                .map_err(|_| EtlError::writer("writer lock poisoned"))?;
            guard.write_batches(&batches)?;
            Ok(FileOutcome::Loaded)
        }
        Err(e @ EtlError::MalformedDocument { .. }) => {
            warn!(file = rel_name, error = %e, "Malformed document quarantined");
            quarantine_file(path, quarantine_dir)?;
            Ok(FileOutcome::Quarantined)
        }
        Err(e) => Err(e),
    }
}

fn quarantine_file(path: &Path, quarantine_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(quarantine_dir)?;
    let file_name = path.file_name().unwrap_or(path.as_os_str());
    std::fs::rename(path, quarantine_dir.join(file_name))?;
    Ok(())
}

fn archive_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let clean = RunOutcome::default();
        assert_eq!(clean.exit_code(), 0);

        let partial = RunOutcome {
            documents_failed: 1,
            ..RunOutcome::default()
        };
        assert_eq!(partial.exit_code(), 3);
    }

    #[test]
    fn test_archive_stem() {
        assert_eq!(archive_stem("dm_spl_release_human_rx_part1.zip"), "dm_spl_release_human_rx_part1");
        assert_eq!(archive_stem("plain"), "plain");
    }
}
