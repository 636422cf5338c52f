//! 'main' for the dingo node process

use anyhow::Result;
use config::{Config, Environment, File};
use tracing::info;

mod configuration;
mod node;

use configuration::NodeConfig;

#[tokio::main]
pub async fn main() -> Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt::init();

    info!("dingo node process");

    // Read the config: defaults, then dingo.toml, then DINGO_* env vars
    let config = Config::builder()
        .add_source(File::with_name("dingo").required(false))
        .add_source(Environment::with_prefix("DINGO"))
        .build()?;
    let config = NodeConfig::try_load(&config)?;

    // Build and run the node; configuration failures exit non-zero
    let node = node::Node::build(config)?;
    node.run().await?;

    info!("exiting");
    Ok(())
}
