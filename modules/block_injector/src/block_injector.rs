//! Meander block injector module for Caryatid
//! Posts blocks from a JSON-lines file into the stream, for demos and
//! end-to-end testing of the sequencer

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use meander_common::messages::{Message, RawBlockMessage};
use tracing::{error, info};

const CONFIG_BLOCK_FILE: &str = "block-file";
const CONFIG_PUBLISH_TOPIC: (&str, &str) = ("publish-topic", "meander.block.raw");

/// Block injector module
#[module(
    message_type(Message),
    name = "block-injector",
    description = "Test block injector"
)]
pub struct BlockInjector;

impl BlockInjector {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let publish_topic = config
            .get_string(CONFIG_PUBLISH_TOPIC.0)
            .unwrap_or(CONFIG_PUBLISH_TOPIC.1.to_string());
        info!("Publishing blocks on '{publish_topic}'");

        let Ok(block_file) = config.get_string(CONFIG_BLOCK_FILE) else {
            error!("No block-file given, injector idle");
            return Ok(());
        };
        info!("Injecting blocks from '{block_file}'");

        context.clone().run(async move {
            let content = match fs::read_to_string(&block_file) {
                Ok(content) => content,
                Err(e) => {
                    error!("Cannot read block file '{block_file}': {e}");
                    return;
                }
            };

            for line in content.lines().filter(|line| !line.trim().is_empty()) {
                let raw: RawBlockMessage = match serde_json::from_str(line) {
                    Ok(raw) => raw,
                    Err(e) => {
                        error!("Bad block line: {e}");
                        continue;
                    }
                };

                info!("  -> block {} ({})", raw.number, raw.id);
                context
                    .message_bus
                    .publish(&publish_topic, Arc::new(Message::RawBlock(raw)))
                    .await
                    .unwrap_or_else(|e| error!("Failed to publish block message: {e}"));
            }
        });

        Ok(())
    }
}
