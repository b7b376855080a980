use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "leasewarden", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Prints the effective configuration
    ShowConfig,
    /// Runs concurrent requests against in-memory stores, all contending for
    /// one lock, and prints when each got it
    Contend {
        /// Lock key to contend for
        #[arg(long, default_value = "user:42")]
        key: String,
        /// Number of concurrent requests
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// How long each request holds the lock
        #[arg(long, default_value_t = 250)]
        hold_ms: u64,
        /// Run the requests as cron jobs rather than interactive requests
        #[arg(long)]
        batch: bool,
    },
}
