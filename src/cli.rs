use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "mattermost-bridge-msteams")]
#[command(about = "Mattermost-Microsoft Teams Bridge", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Validate the configuration file")]
    ValidateConfig,
}

/// One-screen overview printed after a successful validation.
pub fn config_summary(config: &Config) -> String {
    let direct = if config.bridge.sync_direct_messages { "on" } else { "off" };
    [
        format!("listen:            {}:{}", config.bridge.bind_address, config.bridge.port),
        format!("changes url:       {}", config.bridge.changes_url()),
        format!("lifecycle url:     {}", config.bridge.lifecycle_url()),
        format!("sync direction:    {}", config.bridge.sync_direction.as_str()),
        format!("direct messages:   {}", direct),
        format!("change types:      {}", config.bridge.enabled_change_types.join(",")),
        format!("database:          {:?}", config.database.db_type()),
        format!(
            "workers/queue:     {}/{}",
            config.queue.worker_count, config.queue.queue_capacity
        ),
        format!(
            "encrypted content: {}",
            if config.remote.encrypted_resource_data() { "yes" } else { "no" }
        ),
    ]
    .join("\n")
}
