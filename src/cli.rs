//! CLI definitions and dispatch.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::server;

/// Beacon command line interface
#[derive(Debug, Parser)]
#[command(name = "beacon", version, about = "Real-time execution event relay")]
pub struct Cli {
    /// Path to a configuration file
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay server (the default)
    Serve {
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create the database schema and exit
    InitDb,
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = server::AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            info!("Starting Beacon relay v{}", env!("CARGO_PKG_VERSION"));
            server::run(config).await
        }
        Command::InitDb => server::init_db(config).await,
    }
}
