// ABOUTME: Main entry point for the DingTalk agent bridge.
// ABOUTME: Initializes logging, loads config, and runs or probes the configured accounts.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dingbridge::config::Config;
use dingbridge::monitor::{self, Bridge};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dingbridge", about = "DingTalk Stream-mode bot bridge for AI agents")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "dingbridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect the configured accounts and serve (default)
    Run,
    /// Check every account's credentials and exit
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n╔══════════════════════════════════════════════════════════╗");
        eprintln!("║ PANIC! Bridge crashed with the following error:          ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing::info!("Starting DingTalk agent bridge");
    let config = Config::load(&cli.config)?;
    tracing::info!(
        accounts = config.accounts.len(),
        enabled = config.enabled_accounts().count(),
        agent = %config.agent.endpoint,
        "Configuration loaded"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Probe => monitor::probe(&config).await,
        Command::Run => {
            let bridge = Bridge::new(config);
            let cancel = bridge.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                    cancel.cancel();
                }
            });
            bridge.run().await
        }
    }
}
