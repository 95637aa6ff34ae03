use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "keypool",
    version,
    about = "Distributed API key pool coordinator",
    long_about = "Coordinates a shared pool of API credentials across process instances: \
distributed locking, cooldown tracking with self-healing reconciliation, per-key \
concurrency admission and fair key selection."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "KEYPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "KEYPOOL_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the pool server (the default)
    Serve,

    /// Validate a configuration file and exit
    Config {
        /// Configuration file to validate
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}
