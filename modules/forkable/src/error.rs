//! Error types for the forkable sequencer.

use meander_common::BlockId;

use crate::step::StepType;

/// Errors surfaced by [`Forkable::process_block`](crate::processor::Forkable::process_block).
///
/// A broken ancestry walk to the LIB is not an error: the sequencer logs
/// it and waits for the missing blocks to arrive.
#[derive(Debug, thiserror::Error)]
pub enum ForkableError {
    /// The downstream handler refused a block. The cause is preserved
    /// unmodified; fork database state accepted before the failure is
    /// kept.
    #[error("process block {block_id} step={step}: {cause:#}")]
    Handler {
        block_id: BlockId,
        step: StepType,
        cause: anyhow::Error,
    },

    /// The fork database no longer holds a block whose id it just
    /// produced in a segment. The stream cannot safely continue.
    #[error("fork database lost block {block_id} from a segment it produced")]
    SegmentBlockVanished { block_id: BlockId },
}

impl ForkableError {
    /// The handler's own error, when this is a handler failure.
    pub fn handler_cause(&self) -> Option<&anyhow::Error> {
        match self {
            ForkableError::Handler { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
