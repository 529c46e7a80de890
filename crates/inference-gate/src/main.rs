//! Binary entry point: parse the CLI, load configuration, dispatch.

use clap::Parser;
use gate_core::GateMode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use inference_gate::cli::{CacheCommand, Cli, Command, ConfigCommand};
use inference_gate::commands;
use inference_gate::config::GateConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();

    let mut config = GateConfig::load(&config_path)?;
    if cli.verbose {
        config.verbose = true;
    }
    init_tracing(config.verbose);
    tracing::debug!(config_path = %config_path.display(), "configuration loaded");

    match cli.command {
        Command::Start(args) => commands::serve(config, args, GateMode::RecordAndReplay).await,
        Command::Replay(args) => commands::serve(config, args, GateMode::ReplayOnly).await,
        Command::Cache(CacheCommand::List) => commands::cache_list(&config).await,
        Command::Cache(CacheCommand::Info { id }) => commands::cache_info(&config, &id).await,
        Command::Cache(CacheCommand::Clear { yes }) => commands::cache_clear(&config, yes).await,
        Command::Config(ConfigCommand::Show) => commands::config_show(&config),
        Command::Config(ConfigCommand::Init) => commands::config_init(&config_path),
        Command::Config(ConfigCommand::Path) => {
            commands::config_path(&config_path);
            Ok(())
        }
        Command::TestGate => commands::test_gate(&config).await,
        Command::TestUpstream => commands::test_upstream(&config).await,
    }
}

/// Initialize the fmt subscriber. `RUST_LOG` wins when set; otherwise
/// `--verbose` (or `verbose: true` in the config) lowers the default level
/// to debug.
fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}
