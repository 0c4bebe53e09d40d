use anyhow::bail;
use clap::{Parser, Subcommand};
use configuration::{Config, Overrides};
use database::{EngineRegistry, SequenceGenerator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

mod logging;

/// The main entry point for the subscriber service.
fn main() -> anyhow::Result<()> {
    // Secrets such as MPSERVER__DATABASE__PASSWORD may live in a .env file.
    dotenvy::dotenv().ok();

    // Parse command-line arguments
    let cli = Cli::parse();

    let mut config = configuration::load_config(&cli.config)?;
    config.apply(&cli.overrides);

    // Held until main returns so buffered log lines reach the file.
    let _log_guard = logging::init(&config.logging)?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = cli.max_threads {
        runtime.worker_threads(threads);
    }
    let runtime = runtime.build()?;

    runtime.block_on(run(cli.command.unwrap_or(Commands::Serve), config))
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Backend service for an official messaging account.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "conf/config.toml")]
    config: PathBuf,

    /// Number of runtime worker threads (defaults to the CPU count).
    #[arg(long)]
    max_threads: Option<usize>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (the default).
    Serve,
    /// Build the database engine and report whether its probe succeeded.
    Check,
    /// Draw the next value from a database sequence.
    NextId {
        /// Name of the sequence, e.g. `subscriber_id_seq`.
        #[arg(long)]
        sequence: String,
    },
}

// ==============================================================================
// Command Logic
// ==============================================================================

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    // An unreachable database is tolerated here; only an engine that cannot
    // be built at all stops the process.
    let registry = match EngineRegistry::init(&config.database).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(r#type = "init_db_engine_err", err = %e, "Failed to init db engine.");
            return Err(e.into());
        }
    };

    match command {
        Commands::Serve => {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
            web_server::run_server(addr, registry, config.server.request_log_enable).await
        }
        Commands::Check => {
            let engine = registry.master()?;
            println!(
                "{} healthy={} max_open={} max_idle={}",
                engine.descriptor(),
                engine.is_healthy(),
                engine.limits().max_open,
                engine.limits().max_idle
            );
            if !engine.is_healthy() {
                bail!("database engine {} failed its startup probe", engine.descriptor());
            }
            Ok(())
        }
        Commands::NextId { sequence } => {
            let value = SequenceGenerator::new(registry).next_value(&sequence).await?;
            println!("{value}");
            Ok(())
        }
    }
}
