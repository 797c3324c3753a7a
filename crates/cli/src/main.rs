//! Scuttle CLI — the main entry point.
//!
//! Commands:
//! - `onboard` — Write a default config file
//! - `serve`   — Start the HTTP gateway

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "scuttle",
    about = "Scuttle — a session-scoped streaming agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config to ~/.scuttle/config.toml
    Onboard,

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind host
        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard => onboard()?,
        Commands::Serve { port, host } => {
            let mut config = scuttle_config::AppConfig::load()?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            scuttle_gateway::start(config).await?;
        }
    }

    Ok(())
}

fn onboard() -> Result<(), Box<dyn std::error::Error>> {
    let dir = scuttle_config::AppConfig::config_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("config.toml");
    if path.exists() {
        tracing::info!("Config already exists at {}", path.display());
        return Ok(());
    }
    std::fs::write(&path, scuttle_config::AppConfig::default_toml())?;
    tracing::info!("Wrote default config to {}", path.display());
    tracing::info!("Set SCUTTLE_API_KEY (or api_key in the config) before serving.");
    Ok(())
}
