// src/main.rs
use anyhow::Result;
use candle_sync::cli::{execute_command, run_foreground, Cli, Commands};
use candle_sync::config::Settings;
use candle_sync::daemon::{check_daemon_status, start_daemon, stop_daemon};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv::dotenv().ok();

    // Parse command line arguments
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    // Initialize logging, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Execute command
    match cli.command {
        Commands::Run => {
            run_foreground(&settings).await?;
        }
        Commands::Start { detached } => {
            if detached {
                start_daemon(&settings.daemon, cli.config.as_deref()).await?;
            } else {
                run_foreground(&settings).await?;
            }
        }
        Commands::Stop => {
            stop_daemon(&settings.daemon).await?;
        }
        Commands::Status => {
            check_daemon_status(&settings.daemon).await?;
        }
        command => {
            execute_command(command, &settings).await?;
        }
    }

    Ok(())
}
