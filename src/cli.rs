//! CLI argument parsing for the kartoteka-worker binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kartoteka-worker", about = "Kartoteka bulk import worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Load the configuration, print a summary and exit
    CheckConfig,
}
