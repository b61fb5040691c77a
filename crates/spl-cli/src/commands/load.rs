//! `spl-load full-load` / `spl-load delta-load`: run the pipeline.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use tracing::warn;

use spl_common::Result;
use spl_etl::acquisition::LocalDirectorySource;
use spl_etl::config::Settings;
use spl_etl::loader::create_loader;
use spl_etl::{LoadMode, Pipeline};

pub async fn run(settings: &Settings, mode: LoadMode, source: Option<PathBuf>) -> Result<i32> {
    let archive_dir = source.unwrap_or_else(|| settings.download_path.clone());
    let archives = LocalDirectorySource::new(archive_dir);

    let loader = create_loader(settings).await?;
    let pipeline = Pipeline::new(settings.clone(), loader);

    // Cooperative cancellation: Ctrl-C lets the current file finish, the
    // run closes as FAILED, and the process exits 130.
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling after the current file");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let outcome = pipeline.run(mode, &archives).await?;
    if outcome.documents_failed > 0 {
        println!(
            "Load finished with {} quarantined file(s); inspect the run's quarantine directory.",
            outcome.documents_failed
        );
    } else {
        println!(
            "Load finished: {} document(s) from {} archive(s), {} already processed.",
            outcome.documents_loaded, outcome.archives_processed, outcome.archives_skipped
        );
    }
    Ok(outcome.exit_code())
}
