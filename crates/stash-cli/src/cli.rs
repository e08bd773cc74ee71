use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stash",
    about = "Stash: a persistent, size-bounded key/value cache",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding the store logs
    #[arg(long, global = true, default_value = ".stash")]
    pub dir: PathBuf,

    /// Store name (overrides the config file)
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Capacity in estimated bytes (overrides the config file)
    #[arg(long, global = true)]
    pub max_size: Option<u64>,

    /// TOML adapter configuration
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Sync the log to disk after every commit
    #[arg(long, global = true)]
    pub sync: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the value stored under a key
    Get(KeyArgs),
    /// Store a value
    Set(SetArgs),
    /// Remove a key
    Rm(KeyArgs),
    /// List every entry, soonest expiring first
    List,
    /// Remove every entry
    Clear,
    /// Evict expired entries, and more if over capacity
    Sweep,
    /// Show the size estimate and capacity thresholds
    Size,
    /// Rewrite the store log keeping only live entries
    Compact,
}

#[derive(Args)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Args)]
pub struct SetArgs {
    pub key: String,
    /// JSON value; anything that does not parse as JSON is stored as a string
    pub value: String,
    /// Lifetime in seconds (defaults to the configured TTL)
    #[arg(long)]
    pub ttl: Option<u64>,
}
