//! Pocketclaw entry point.
//!
//! One binary, three surfaces: the agent daemon (default), the relay
//! service (`relay`), and the configuration commands (`setup`, `config`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pocketclaw::config::{AgentConfig, AgentStore};
use pocketclaw::relay::RelayConfig;
use pocketclaw::setup::SetupArgs;
use pocketclaw::{agent, relay, setup};

#[derive(Parser)]
#[command(name = "pocketclaw")]
#[command(version)]
#[command(about = "Drive a code-generation CLI on your dev box from your phone")]
struct Cli {
    /// Configuration store path
    #[arg(short, long, env = "POCKETCLAW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service
    Relay {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value_t = 8790)]
        port: u16,
    },

    /// Write the agent configuration store
    Setup(SetupArgs),

    /// Show the effective agent configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pocketclaw={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store_path = cli.config.unwrap_or_else(AgentStore::default_path);

    match cli.command {
        Some(Commands::Relay { host, port }) => {
            relay::run(RelayConfig { host, port }).await?;
        }
        Some(Commands::Setup(args)) => {
            setup::run(&store_path, args)?;
        }
        Some(Commands::Config) => {
            let config = AgentConfig::resolve(&store_path)?;
            println!("{}", config.redacted());
        }
        None => {
            let config = AgentConfig::resolve(&store_path)?;
            agent::run(config).await?;
        }
    }
    Ok(())
}
