//! Server binary: load config, start the channel and HTTP servers, run
//! until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voxgate::config::Config;
use voxgate::server::{self, ServerContext};

#[derive(Parser)]
#[command(name = "voxgate", version, about = "Real-time voice-assistant gateway")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "VOXGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the channel port
    #[arg(long)]
    port: Option<u16>,

    /// Override the HTTP port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            info!("No config file given, using defaults");
            Config::load_default()
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(http_port) = cli.http_port {
        config.server.http_port = http_port;
    }

    info!(
        "Channel address is ws://{}:{}{}",
        config.server.host,
        config.server.port,
        config.ws_path()
    );
    info!(
        "Bootstrap endpoint is http://{}:{}/{}/ota/",
        config.server.host, config.server.http_port, config.server.ws_prefix
    );
    if let Some(endpoint) = &config.mcp_endpoint {
        info!("Tool endpoint is {}", endpoint);
    }

    let ctx = ServerContext::new(config, cli.config.clone())?;

    let ws_task = tokio::spawn(server::start_ws_server(ctx.clone()));
    let http_task = tokio::spawn(server::start_http_server(ctx.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = ws_task => {
            if let Ok(Err(e)) = result {
                error!("Channel server exited: {}", e);
            }
        }
        result = http_task => {
            if let Ok(Err(e)) = result {
                error!("HTTP server exited: {}", e);
            }
        }
    }

    info!("Server is down, exiting");
    Ok(())
}
