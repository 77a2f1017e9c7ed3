//! Meander forkable module for Caryatid
//! Sequences a forking block stream into ordered step events

pub mod error;
pub mod fork_db;
pub mod handler;
pub mod processor;
pub mod step;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use meander_common::messages::{ForkStep, Message, StepBlockMessage};
use meander_common::{BlockRef, StreamBlock};
use tracing::{error, info};

use crate::handler::StepBuffer;
use crate::processor::Forkable;
use crate::step::StepType;

const CONFIG_SUBSCRIBE_TOPIC: (&str, &str) = ("subscribe-topic", "meander.block.raw");
const CONFIG_PUBLISH_TOPIC: (&str, &str) = ("publish-topic", "meander.block.step");

/// Forkable sequencer module
#[module(
    message_type(Message),
    name = "forkable",
    description = "Fork-aware block stream sequencer"
)]
pub struct ForkableModule;

impl ForkableModule {
    /// Parse the configured external step filter into the internal mask.
    fn configured_filter(config: &Config) -> Result<StepType> {
        let raw = config.get_string("filter-steps").unwrap_or_default();
        let mut steps = Vec::new();
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            steps.push(token.parse::<ForkStep>().map_err(|e| anyhow!(e))?);
        }
        Ok(StepType::from_fork_steps(&steps))
    }

    fn configured_forkable(config: &Config, sink: Arc<StepBuffer>) -> Result<Forkable<()>> {
        let filter = Self::configured_filter(config)?;
        info!("Emitting steps: {filter}");

        let mut forkable: Forkable<()> = Forkable::new(Box::new(sink)).with_filters(filter);

        if let Ok(id) = config.get_string("inclusive-lib") {
            info!("Starting from inclusive LIB '{id}'");
            forkable = forkable.with_inclusive_lib(BlockRef::from_id(&id));
        } else if let Ok(id) = config.get_string("exclusive-lib") {
            info!("Starting from exclusive LIB '{id}'");
            forkable = forkable.with_exclusive_lib(BlockRef::from_id(&id));
        }

        if let Ok(id) = config.get_string("ensure-block-flows") {
            forkable = forkable.ensure_block_flows(BlockRef::from_id(&id));
        }

        if config.get_bool("ensure-all-blocks-trigger").unwrap_or(false) {
            forkable = forkable.ensure_all_blocks_trigger_longest_chain();
        }

        Ok(forkable)
    }

    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let subscribe_topic = config
            .get_string(CONFIG_SUBSCRIBE_TOPIC.0)
            .unwrap_or(CONFIG_SUBSCRIBE_TOPIC.1.to_string());
        info!("Creating blocks subscriber on '{subscribe_topic}'");

        let publish_topic = config
            .get_string(CONFIG_PUBLISH_TOPIC.0)
            .unwrap_or(CONFIG_PUBLISH_TOPIC.1.to_string());
        info!("Publishing step events on '{publish_topic}'");

        let sink = Arc::new(StepBuffer::new());
        let mut forkable = Self::configured_forkable(&config, sink.clone())?;

        let mut subscription = context.subscribe(&subscribe_topic).await?;
        context.clone().run(async move {
            loop {
                let Ok((_, message)) = subscription.read().await else {
                    error!("Block message read failed");
                    return;
                };

                match message.as_ref() {
                    Message::RawBlock(raw) => {
                        let block = Arc::new(StreamBlock::from(raw));
                        if let Err(e) = forkable.process_block(block, None) {
                            error!("Sequencing failed: {e}");
                            return;
                        }

                        for emitted in sink.drain() {
                            // Handoff is reserved and never buffered
                            let Some(kind) = emitted.step.kind() else {
                                continue;
                            };
                            let step_message = StepBlockMessage::new(
                                kind,
                                &emitted.block,
                                emitted.step_index,
                                emitted.step_count,
                            );
                            context
                                .message_bus
                                .publish(&publish_topic, Arc::new(Message::Step(step_message)))
                                .await
                                .unwrap_or_else(|e| error!("Failed to publish: {e}"));
                        }
                    }

                    _ => error!("Unexpected message type: {message:?}"),
                }
            }
        });

        Ok(())
    }
}
