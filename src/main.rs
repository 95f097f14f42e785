#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod db;
mod emoji;
mod mattermost;
mod msteams;
mod parsers;
mod utils;
mod web;

use bridge::BridgeCore;
use cli::{Cli, Commands};
use config::Config;
use mattermost::{LocalApi, MattermostClient};
use msteams::{GraphClient, RemoteApi};
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if let Some(Commands::ValidateConfig) = cli.command {
        println!("configuration is valid: {}", cli.config.display());
        println!("{}", cli::config_summary(&config));
        return Ok(());
    }

    utils::logging::init_tracing(&config.logging);
    let config = Arc::new(config);
    info!("mattermost-msteams bridge starting up");

    if config.metrics.enabled {
        web::metrics::install_recorder()?;
    }

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;

    let remote: Arc<dyn RemoteApi> = Arc::new(GraphClient::new(&config.remote)?);
    let local: Arc<dyn LocalApi> = Arc::new(MattermostClient::new(&config.local)?);

    let bridge = Arc::new(BridgeCore::new(
        config.clone(),
        db_manager.clone(),
        remote,
        local,
    )?);

    let web_server = WebServer::new(config.clone(), db_manager.clone(), bridge.clone())?;
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });
    tokio::pin!(web_handle);

    bridge.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, beginning shutdown");
        },
        _ = &mut web_handle => {
            info!("web server task exited, beginning shutdown");
        },
    }

    bridge.shutdown().await;
    web_handle.abort();

    info!("mattermost-msteams bridge shut down");
    Ok(())
}
