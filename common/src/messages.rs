//! Definition of Meander messages

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::types::{BlockId, StreamBlock};

/// Raw block announcement, published by an upstream source on the raw
/// blocks topic and consumed by the forkable sequencer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RawBlockMessage {
    pub id: BlockId,
    pub number: u64,
    pub previous_id: BlockId,
    pub lib_number: u64,

    /// Raw Data
    pub payload: Vec<u8>,
}

impl From<&RawBlockMessage> for StreamBlock {
    fn from(msg: &RawBlockMessage) -> Self {
        StreamBlock {
            id: msg.id.clone(),
            number: msg.number,
            previous_id: msg.previous_id.clone(),
            lib_number: msg.lib_number,
            payload: msg.payload.clone(),
        }
    }
}

impl From<&StreamBlock> for RawBlockMessage {
    fn from(block: &StreamBlock) -> Self {
        RawBlockMessage {
            id: block.id.clone(),
            number: block.number,
            previous_id: block.previous_id.clone(),
            lib_number: block.lib_number,
            payload: block.payload.clone(),
        }
    }
}

/// Every step kind the sequencer emits on its publish topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    New,
    Undo,
    Redo,
    Irreversible,
    Stalled,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::New => "new",
            StepKind::Undo => "undo",
            StepKind::Redo => "redo",
            StepKind::Irreversible => "irreversible",
            StepKind::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

/// The step kinds external subscribers may filter on. Redo has no
/// external value - subscribers asking for both new and undo receive
/// redos as part of the same contract. Stalled and handoff are internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkStep {
    New,
    Undo,
    Irreversible,
}

impl FromStr for ForkStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "new" => Ok(ForkStep::New),
            "undo" => Ok(ForkStep::Undo),
            "irreversible" => Ok(ForkStep::Irreversible),
            other => Err(format!("unknown fork step '{other}'")),
        }
    }
}

/// A single step event on the publish topic. Multi-block steps (undo and
/// redo batches, irreversible and stalled segments) carry their position
/// within the batch; singleton new events leave the batch fields at zero.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StepBlockMessage {
    pub step: StepKind,
    pub id: BlockId,
    pub number: u64,
    pub previous_id: BlockId,
    pub lib_number: u64,

    /// Index for the current block within a multi-block step
    pub step_index: usize,

    /// Total number of blocks in a multi-block step
    pub step_count: usize,

    /// Raw Data
    pub payload: Vec<u8>,
}

impl StepBlockMessage {
    pub fn new(step: StepKind, block: &Arc<StreamBlock>, step_index: usize, step_count: usize) -> Self {
        Self {
            step,
            id: block.id.clone(),
            number: block.number,
            previous_id: block.previous_id.clone(),
            lib_number: block.lib_number,
            step_index,
            step_count,
            payload: block.payload.clone(),
        }
    }
}

/// Project-wide message enum carried on the bus
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),          // Simple string
    JSON(serde_json::Value), // JSON object

    // Block stream messages
    RawBlock(RawBlockMessage), // Upstream block announcement
    Step(StepBlockMessage),    // Sequenced step event
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_step_parses_known_names() {
        assert_eq!("new".parse::<ForkStep>().unwrap(), ForkStep::New);
        assert_eq!(" undo ".parse::<ForkStep>().unwrap(), ForkStep::Undo);
        assert_eq!(
            "irreversible".parse::<ForkStep>().unwrap(),
            ForkStep::Irreversible
        );
        assert!("redo".parse::<ForkStep>().is_err());
    }

    #[test]
    fn step_message_copies_block_fields() {
        let block = Arc::new(StreamBlock::test_with_lib("00000004a", "00000003a", 2));
        let msg = StepBlockMessage::new(StepKind::Irreversible, &block, 1, 3);
        assert_eq!(msg.id, "00000004a");
        assert_eq!(msg.number, 4);
        assert_eq!(msg.previous_id, "00000003a");
        assert_eq!(msg.lib_number, 2);
        assert_eq!((msg.step_index, msg.step_count), (1, 3));
    }

    #[test]
    fn raw_block_round_trips_to_stream_block() {
        let raw = RawBlockMessage {
            id: "00000002a".into(),
            number: 2,
            previous_id: "00000001a".into(),
            lib_number: 1,
            payload: vec![1, 2, 3],
        };
        let block = StreamBlock::from(&raw);
        assert_eq!(RawBlockMessage::from(&block), raw);
    }
}
