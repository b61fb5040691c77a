//! Command-line interface for the SPL warehouse loader.
//!
//! - `spl-load init`: create production, staging, and tracking tables
//! - `spl-load full-load [--source DIR]`: rebuild the warehouse from every
//!   archive in one atomic publication cycle
//! - `spl-load delta-load`: incrementally load archives missing from the
//!   processed ledger
//!
//! Exit codes: 0 success, 1 configuration error, 2 loader/database error,
//! 3 partial failure (some files quarantined), 130 canceled.
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// SPL warehouse loader
#[derive(Parser, Debug)]
#[command(name = "spl-load")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log output format ('json' or 'text')
    #[arg(long, global = true, env = "SPL_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Verbose (debug-level) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the warehouse schema
    Init,

    /// Full load: rebuild production tables from all archives
    FullLoad {
        /// Directory containing source archives; when omitted, the
        /// configured download path (populated by the acquisition
        /// collaborator) is used
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Incremental load of archives not yet recorded in the ledger
    DeltaLoad,
}
