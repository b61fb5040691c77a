//! spl-load entry point

use std::process;

use clap::Parser;
use tracing::error;

use spl_cli::{Cli, Commands};
use spl_common::logging::{init_logging, LogFormat};
use spl_common::Result;
use spl_etl::{LoadMode, Settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = match cli.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = init_logging(format, cli.verbose) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    match execute(&cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    }
}

async fn execute(cli: &Cli) -> Result<i32> {
    // Fail fast on bad settings before touching disk or the database.
    let settings = Settings::load()?;

    match &cli.command {
        Commands::Init => {
            spl_cli::commands::init::run(&settings).await?;
            Ok(0)
        }
        Commands::FullLoad { source } => {
            spl_cli::commands::load::run(&settings, LoadMode::Full, source.clone()).await
        }
        Commands::DeltaLoad => spl_cli::commands::load::run(&settings, LoadMode::Delta, None).await,
    }
}
