//! `spl-load init`: create the warehouse schema idempotently.

use tracing::info;

use spl_common::Result;
use spl_etl::config::Settings;
use spl_etl::loader::create_loader;

pub async fn run(settings: &Settings) -> Result<()> {
    let loader = create_loader(settings).await?;
    loader.initialize_schema().await?;
    info!(adapter = %settings.db.adapter, "Schema initialized");
    println!("Warehouse schema initialized.");
    Ok(())
}
