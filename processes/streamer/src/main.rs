//! 'main' for the Meander streamer process

use anyhow::Result;
use caryatid_process::Process;
use config::{Config, Environment, File};
use meander_common::messages::Message;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber;

// External modules
use meander_module_block_injector::BlockInjector;
use meander_module_forkable::ForkableModule;

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt::init();

    info!("Meander streamer process");

    // Read the config
    let config = Arc::new(
        Config::builder()
            .add_source(File::with_name("streamer"))
            .add_source(Environment::with_prefix("MEANDER"))
            .build()
            .unwrap(),
    );

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    BlockInjector::register(&mut process);
    ForkableModule::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");
    Ok(())
}
