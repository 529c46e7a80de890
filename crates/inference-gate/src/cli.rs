//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_CONFIG_FILE: &str = "inference-gate.yaml";

#[derive(Debug, Parser)]
#[command(name = "inference-gate", version, about = "Recording reverse proxy for OpenAI-compatible inference APIs")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve in record-and-replay mode: misses are forwarded upstream and
    /// recorded.
    Start(ServeArgs),
    /// Serve in replay-only mode: misses get a 404, the upstream is never
    /// contacted.
    Replay(ServeArgs),
    /// Inspect or clear the recording store.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Show or initialize the configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send the configured test prompt through a running gate.
    TestGate,
    /// Send the configured test prompt directly to the upstream.
    TestUpstream,
}

#[derive(Debug, Args, Default)]
pub struct ServeArgs {
    /// Listen address, overrides the configured host.
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port, overrides the configured port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Upstream base URL, overrides the configured upstream.
    #[arg(long)]
    pub upstream: Option<String>,

    /// Cache directory, overrides the configured path.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// List recorded entries.
    List,
    /// Print the full detail of one entry.
    Info {
        /// Entry id (fingerprint hex digest).
        id: String,
    },
    /// Remove all recorded entries.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (api_key excluded).
    Show,
    /// Write a commented default configuration file.
    Init,
    /// Print the resolved configuration file path.
    Path,
}
