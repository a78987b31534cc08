// src/main.rs
// codemem - local-first persistent memory store for developer agent CLIs

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use codemem::config::Config;
use codemem::identity::load_or_create;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        None | Some(Commands::Mcp) | Some(Commands::Serve) => Level::WARN,
        Some(Commands::Ingest) => Level::WARN,
        Some(Commands::Sync { action: cli::SyncAction::Daemon }) => Level::INFO,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(e) = run(cli).await {
        eprintln!("[codemem] error: {}", e.to_user_string());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> codemem::error::Result<()> {
    let config = Config::load();
    std::fs::create_dir_all(&config.data_dir)?;
    let identity = load_or_create(&config)?;

    match cli.command.unwrap_or(Commands::Mcp) {
        Commands::Ingest => cli::run_ingest(&config).await,
        Commands::Mcp | Commands::Serve => cli::run_mcp_server(&config).await,
        Commands::Sync { action } => cli::run_sync(&config, &identity, action).await,
        Commands::Export => cli::run_export_import(&config, &identity, true).await,
        Commands::Import => cli::run_export_import(&config, &identity, false).await,
        command @ (Commands::BackfillTags { .. }
        | Commands::BackfillDiscoveryTokens { .. }
        | Commands::Embed { .. }
        | Commands::FlushRawEvents
        | Commands::RawEventsStatus { .. }
        | Commands::RawEventsRetry
        | Commands::RawEventsGate { .. }
        | Commands::PackBenchmark { .. }
        | Commands::HybridEval { .. }
        | Commands::Db { .. }) => cli::run_maintenance(&config, &identity, command).await,
    }
}
