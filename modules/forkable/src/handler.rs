//! Downstream handler seam: the step event object and the trait the
//! sequencer delivers it through.

use std::sync::{Arc, Mutex};

use meander_common::StreamBlock;

use crate::fork_db::{ForkDB, PreparedBlock};
use crate::step::StepType;

/// The event object accompanying every block delivered to a handler.
///
/// `fork_db` is a view into the live fork database, valid only for the
/// duration of the synchronous call - the borrow makes escaping it to
/// another task a compile error. Multi-block steps (undo/redo batches,
/// irreversible and stalled segments) carry the whole batch in
/// `step_blocks` with this block's position in `step_index`; singleton
/// new events leave the batch fields at zero/empty.
pub struct StepEvent<'a, O> {
    pub step: StepType,
    pub fork_db: &'a ForkDB<O>,

    /// The opaque object attached to this block at ingestion, if any.
    pub obj: Option<&'a O>,

    pub step_index: usize,
    pub step_count: usize,
    pub step_blocks: &'a [PreparedBlock<O>],
}

/// Downstream sink for step events. Implementations needing mutable
/// state use interior mutability; calls are strictly serial.
///
/// Returning an error short-circuits the ingest that produced the event.
pub trait Handler<O> {
    fn process_block(&self, block: &Arc<StreamBlock>, event: StepEvent<'_, O>) -> anyhow::Result<()>;
}

impl<O, H: Handler<O> + ?Sized> Handler<O> for Arc<H> {
    fn process_block(&self, block: &Arc<StreamBlock>, event: StepEvent<'_, O>) -> anyhow::Result<()> {
        (**self).process_block(block, event)
    }
}

/// A step emission captured by [`StepBuffer`].
#[derive(Debug, Clone)]
pub struct BufferedStep {
    pub step: StepType,
    pub block: Arc<StreamBlock>,
    pub step_index: usize,
    pub step_count: usize,
}

/// Handler that records emissions for the owner to drain after each
/// ingest. Bridges the synchronous sequencer to async publication: the
/// module runs the sequencer, then drains and publishes.
#[derive(Default)]
pub struct StepBuffer {
    steps: Mutex<Vec<BufferedStep>>,
}

impl StepBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything buffered so far, oldest first.
    pub fn drain(&self) -> Vec<BufferedStep> {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *steps)
    }
}

impl<O> Handler<O> for StepBuffer {
    fn process_block(&self, block: &Arc<StreamBlock>, event: StepEvent<'_, O>) -> anyhow::Result<()> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(BufferedStep {
                step: event.step,
                block: block.clone(),
                step_index: event.step_index,
                step_count: event.step_count,
            });
        Ok(())
    }
}
