//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shelf_core::ShelfConfig;

pub mod run;
pub mod status;

/// Shelf - book-club data sync
#[derive(Parser)]
#[command(name = "shelf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a shelf.toml configuration file
    #[arg(short, long, global = true, env = "SHELF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync from source extracts
    Run(run::RunArgs),

    /// Show document and graph counts
    Status,
}

impl Cli {
    pub async fn execute(self) -> Result<ExitCode> {
        let config = ShelfConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::Run(args) => run::execute(args, &config).await,
            Commands::Status => status::execute(&config).await.map(|()| ExitCode::SUCCESS),
        }
    }
}
