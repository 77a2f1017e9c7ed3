//! The forkable sequencer: turns an unordered, possibly-forking block
//! stream into an ordered sequence of step events.
//!
//! Each ingested block updates the fork database, and when the block
//! extends the longest chain the sequencer emits, in order: the undo
//! batch of the abandoned fork, the redo batch of the recovered fork,
//! the new blocks of the winning chain, then - when the LIB advanced -
//! the irreversible segment and the stalled blocks it leaves behind.

use std::sync::Arc;

use meander_common::{BlockId, BlockRef, StreamBlock};
use tracing::debug;

use crate::error::ForkableError;
use crate::fork_db::{ChainBlock, ForkDB, PreparedBlock};
use crate::handler::{Handler, StepEvent};
use crate::step::StepType;

/// Fork-aware sequencer over blocks carrying an opaque preprocessed
/// object of type `O`. Owns its fork database; not re-entrant - the
/// owner calls [`process_block`](Self::process_block) serially.
pub struct Forkable<O> {
    handler: Box<dyn Handler<O> + Send>,
    fork_db: ForkDB<O>,
    last_block_sent: Option<Arc<StreamBlock>>,
    filter_steps: StepType,

    ensure_block_flows: BlockRef,
    ensure_block_flowed: bool,

    ensure_all_blocks_trigger_longest_chain: bool,

    include_initial_lib: bool,

    last_longest_chain: Vec<ChainBlock>,
}

impl<O> Forkable<O> {
    pub fn new(handler: Box<dyn Handler<O> + Send>) -> Self {
        Self {
            handler,
            fork_db: ForkDB::new(),
            last_block_sent: None,
            filter_steps: StepType::all(),
            ensure_block_flows: BlockRef::empty(),
            ensure_block_flowed: false,
            ensure_all_blocks_trigger_longest_chain: false,
            include_initial_lib: false,
            last_longest_chain: Vec::new(),
        }
    }

    /// Only emit the given step kinds; everything else is suppressed at
    /// emission time but still tracked internally.
    pub fn with_filters(mut self, steps: StepType) -> Self {
        self.filter_steps = steps;
        self
    }

    /// Seed the LIB with a known irreversible anchor. The anchor itself
    /// is never emitted.
    pub fn with_exclusive_lib(mut self, lib: BlockRef) -> Self {
        self.fork_db.init_lib(lib);
        self
    }

    /// Seed the LIB and emit the anchor block itself as new and
    /// irreversible when it is the first block received.
    pub fn with_inclusive_lib(mut self, lib: BlockRef) -> Self {
        self.fork_db.init_lib(lib);
        self.include_initial_lib = true;
        self
    }

    /// Target chain selection at this block until it has flowed as new.
    pub fn ensure_block_flows(mut self, block_ref: BlockRef) -> Self {
        self.ensure_block_flows = block_ref;
        self
    }

    /// Recompute the longest chain on every ingest, not only when the
    /// head advances. Lets equal-height siblings win immediately.
    pub fn ensure_all_blocks_trigger_longest_chain(mut self) -> Self {
        self.ensure_all_blocks_trigger_longest_chain = true;
        self
    }

    /// Read access to the fork database.
    pub fn fork_db(&self) -> &ForkDB<O> {
        &self.fork_db
    }

    /// Ingest one block and synchronously deliver whatever step events
    /// it causes. Handler errors short-circuit; fork database state
    /// already accepted stays.
    pub fn process_block(
        &mut self,
        block: Arc<StreamBlock>,
        obj: Option<Arc<O>>,
    ) -> Result<(), ForkableError> {
        // Late ancestor, already below the LIB: nothing left to say
        if block.number < self.fork_db.lib_num() && self.last_block_sent.is_some() {
            return Ok(());
        }

        let triggers_new_longest_chain = self.triggers_new_longest_chain(&block);
        debug!(block = %block, new_longest_chain = triggers_new_longest_chain, "processing block");

        if self.include_initial_lib
            && self.last_block_sent.is_none()
            && block.id == self.fork_db.lib_id()
        {
            return self.process_initial_inclusive_irreversible_block(block, obj);
        }

        // Chain-switch segments are computed against the state before
        // this block is linked
        let mut undos = Vec::new();
        let mut redos = Vec::new();
        if self.filter_steps.intersects(StepType::UNDO | StepType::REDO)
            && triggers_new_longest_chain
        {
            if let Some(last_sent) = self.last_block_sent.clone() {
                (undos, redos) =
                    self.sent_chain_switch_segments(&last_sent.id, &block.previous_id)?;
            }
        }

        let previous_ref = block.previous_ref();
        if self.fork_db.add_link(&block, &previous_ref, obj) {
            return Ok(());
        }

        // Always skip processing until a LIB is set
        if !self.fork_db.has_lib() {
            self.fork_db
                .try_set_lib(&block.block_ref(), &previous_ref, block.lib_number);
        }
        if !self.fork_db.has_lib() {
            return Ok(());
        }

        let longest_chain = self.compute_new_longest_chain(&block);
        if !triggers_new_longest_chain || longest_chain.is_empty() {
            return Ok(());
        }

        debug!(
            block = %block,
            chain_length = longest_chain.len(),
            undos_length = undos.len(),
            redos_length = redos.len(),
            "got longest chain"
        );

        if self.filter_steps.intersects(StepType::UNDO) {
            self.emit_batch(&undos, StepType::UNDO)?;
        }
        if self.filter_steps.intersects(StepType::REDO) {
            self.emit_batch(&redos, StepType::REDO)?;
        }

        self.process_new_blocks(&longest_chain)?;

        let Some(last_sent) = self.last_block_sent.clone() else {
            return Ok(());
        };

        let new_lib_num = last_sent.lib_number;
        let Some(lib_ref) = self
            .fork_db
            .block_in_current_chain(&last_sent.block_ref(), new_lib_num)
        else {
            debug!(new_head_block = %last_sent, new_lib_num, "missing links to reach lib_num");
            return Ok(());
        };

        let Some((irreversible_segment, stalled_segment)) =
            self.fork_db.has_new_irreversible_segment(&lib_ref)
        else {
            return Ok(());
        };

        debug!(lib_id = %lib_ref.id, lib_num = lib_ref.number, "moving lib");
        let irreversible = self.resolve_segment(&irreversible_segment)?;
        let stalled = self.resolve_segment(&stalled_segment)?;
        self.fork_db.move_lib(lib_ref);

        if self.filter_steps.intersects(StepType::IRREVERSIBLE) {
            self.emit_batch(&irreversible, StepType::IRREVERSIBLE)?;
        }
        if self.filter_steps.intersects(StepType::STALLED) {
            self.emit_batch(&stalled, StepType::STALLED)?;
        }

        Ok(())
    }

    fn triggers_new_longest_chain(&self, block: &StreamBlock) -> bool {
        if self.ensure_all_blocks_trigger_longest_chain {
            return true;
        }
        match &self.last_block_sent {
            None => true,
            Some(last_sent) => block.number > last_sent.number,
        }
    }

    fn target_chain_block(&self, block: &StreamBlock) -> BlockRef {
        if !self.ensure_block_flows.is_empty() && !self.ensure_block_flowed {
            return self.ensure_block_flows.clone();
        }
        block.block_ref()
    }

    fn compute_new_longest_chain(&mut self, block: &StreamBlock) -> Vec<ChainBlock> {
        let mut longest_chain = std::mem::take(&mut self.last_longest_chain);

        // Extending linearly at the tail is cheap, but only while the
        // LIB has not moved since the chain was computed - a moved LIB
        // truncates the chain from the bottom
        let can_skip_recompute = match (longest_chain.first(), longest_chain.last()) {
            (Some(first), Some(tail)) => {
                block.previous_id == tail.id && self.fork_db.lib_num() + 1 == first.number
            }
            _ => false,
        };

        if can_skip_recompute {
            longest_chain.push(ChainBlock {
                id: block.id.clone(),
                number: block.number,
            });
        } else {
            longest_chain = self
                .fork_db
                .reversible_segment(&self.target_chain_block(block));
        }

        self.last_longest_chain = longest_chain.clone();
        longest_chain
    }

    fn sent_chain_switch_segments(
        &self,
        current_head_id: &str,
        new_heads_previous_id: &str,
    ) -> Result<(Vec<PreparedBlock<O>>, Vec<PreparedBlock<O>>), ForkableError> {
        if current_head_id == new_heads_previous_id {
            return Ok((Vec::new(), Vec::new()));
        }

        let (undo_ids, redo_ids) = self
            .fork_db
            .chain_switch_segments(current_head_id, new_heads_previous_id);

        let undos = self.sent_chain_segment(&undo_ids, false)?;
        let redos = self.sent_chain_segment(&redo_ids, true)?;
        Ok((undos, redos))
    }

    fn sent_chain_segment(
        &self,
        ids: &[BlockId],
        doing_redos: bool,
    ) -> Result<Vec<PreparedBlock<O>>, ForkableError> {
        let mut segment = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(prepared) = self.fork_db.block_for_id(id) else {
                return Err(ForkableError::SegmentBlockVanished {
                    block_id: id.clone(),
                });
            };

            // A block never flowed as new cannot be redone
            if doing_redos && !self.fork_db.is_sent_as_new(id) {
                continue;
            }

            segment.push(prepared.clone());
        }
        Ok(segment)
    }

    fn resolve_segment(
        &self,
        segment: &[ChainBlock],
    ) -> Result<Vec<PreparedBlock<O>>, ForkableError> {
        segment
            .iter()
            .map(|chain_block| {
                self.fork_db.block_for_id(&chain_block.id).cloned().ok_or_else(|| {
                    ForkableError::SegmentBlockVanished {
                        block_id: chain_block.id.clone(),
                    }
                })
            })
            .collect()
    }

    fn emit_batch(
        &self,
        blocks: &[PreparedBlock<O>],
        step: StepType,
    ) -> Result<(), ForkableError> {
        for (step_index, prepared) in blocks.iter().enumerate() {
            let event = StepEvent {
                step,
                fork_db: &self.fork_db,
                obj: prepared.obj.as_deref(),
                step_index,
                step_count: blocks.len(),
                step_blocks: blocks,
            };
            self.handler
                .process_block(&prepared.block, event)
                .map_err(|cause| ForkableError::Handler {
                    block_id: prepared.block.id.clone(),
                    step,
                    cause,
                })?;
            debug!(block = %prepared.block, step = %step, "sent block");
        }
        Ok(())
    }

    fn process_new_blocks(&mut self, longest_chain: &[ChainBlock]) -> Result<(), ForkableError> {
        for chain_block in longest_chain {
            if self.fork_db.is_sent_as_new(&chain_block.id) {
                continue;
            }

            let (block, obj) = match self.fork_db.block_for_id(&chain_block.id) {
                Some(prepared) => (prepared.block.clone(), prepared.obj.clone()),
                None => {
                    return Err(ForkableError::SegmentBlockVanished {
                        block_id: chain_block.id.clone(),
                    })
                }
            };

            if self.filter_steps.intersects(StepType::NEW) {
                let event = StepEvent {
                    step: StepType::NEW,
                    fork_db: &self.fork_db,
                    obj: obj.as_deref(),
                    step_index: 0,
                    step_count: 0,
                    step_blocks: &[],
                };
                self.handler
                    .process_block(&block, event)
                    .map_err(|cause| ForkableError::Handler {
                        block_id: block.id.clone(),
                        step: StepType::NEW,
                        cause,
                    })?;
            }

            debug!(block = %block, "sending block as new to consumer");
            self.block_flowed(&block);
            self.fork_db.mark_sent_as_new(&chain_block.id);
            self.last_block_sent = Some(block);
        }
        Ok(())
    }

    /// The first block received is the configured inclusive LIB: flow it
    /// as new, then immediately as a one-block irreversible segment. The
    /// block never enters the fork database.
    fn process_initial_inclusive_irreversible_block(
        &mut self,
        block: Arc<StreamBlock>,
        obj: Option<Arc<O>>,
    ) -> Result<(), ForkableError> {
        let prepared = PreparedBlock {
            block: block.clone(),
            obj,
        };

        if self.filter_steps.intersects(StepType::NEW) {
            let event = StepEvent {
                step: StepType::NEW,
                fork_db: &self.fork_db,
                obj: prepared.obj.as_deref(),
                step_index: 0,
                step_count: 0,
                step_blocks: &[],
            };
            self.handler
                .process_block(&block, event)
                .map_err(|cause| ForkableError::Handler {
                    block_id: block.id.clone(),
                    step: StepType::NEW,
                    cause,
                })?;
        }

        debug!(block = %block, "sending configured initial lib block");
        self.block_flowed(&block);
        self.last_block_sent = Some(block);

        let batch = [prepared];
        if self.filter_steps.intersects(StepType::IRREVERSIBLE) {
            self.emit_batch(&batch, StepType::IRREVERSIBLE)?;
        }
        Ok(())
    }

    fn block_flowed(&mut self, block: &StreamBlock) {
        if self.ensure_block_flows.is_empty() || self.ensure_block_flowed {
            return;
        }
        if block.id == self.ensure_block_flows.id {
            self.ensure_block_flowed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Recorded {
        step: StepType,
        block_id: BlockId,
        step_index: usize,
        step_count: usize,
        step_block_ids: Vec<BlockId>,
    }

    /// Recording sink, optionally failing on a chosen step kind.
    #[derive(Default)]
    struct TestSink {
        seen: Mutex<Vec<Recorded>>,
        fail_on: Option<(StepType, String)>,
    }

    impl TestSink {
        fn failing_on(step: StepType, message: &str) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on: Some((step, message.to_string())),
            }
        }

        fn records(&self) -> Vec<Recorded> {
            self.seen.lock().unwrap().clone()
        }

        fn steps_seen(&self) -> Vec<(StepType, BlockId)> {
            self.records()
                .into_iter()
                .map(|r| (r.step, r.block_id))
                .collect()
        }
    }

    impl Handler<()> for TestSink {
        fn process_block(&self, block: &Arc<StreamBlock>, event: StepEvent<'_, ()>) -> anyhow::Result<()> {
            if let Some((step, message)) = &self.fail_on {
                if event.step == *step {
                    return Err(anyhow!("{message}"));
                }
            }
            self.seen.lock().unwrap().push(Recorded {
                step: event.step,
                block_id: block.id.clone(),
                step_index: event.step_index,
                step_count: event.step_count,
                step_block_ids: event.step_blocks.iter().map(|b| b.block.id.clone()).collect(),
            });
            Ok(())
        }
    }

    fn forkable(sink: &Arc<TestSink>) -> Forkable<()> {
        Forkable::new(Box::new(sink.clone()))
    }

    fn bref(id: &str) -> BlockRef {
        BlockRef::from_id(id)
    }

    fn process(f: &mut Forkable<()>, id: &str, previous_id: &str, lib: u64) {
        f.process_block(Arc::new(StreamBlock::test_with_lib(id, previous_id, lib)), None)
            .unwrap();
    }

    fn pair(step: StepType, id: &str) -> (StepType, BlockId) {
        (step, id.to_string())
    }

    #[test]
    fn linear_chain_advances_lib_behind_the_head() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink)
            .with_filters(StepType::NEW | StepType::IRREVERSIBLE)
            .with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 1);
        process(&mut f, "00000003a", "00000002a", 2);
        process(&mut f, "00000004a", "00000003a", 3);

        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
                pair(StepType::IRREVERSIBLE, "00000002a"),
                pair(StepType::NEW, "00000004a"),
                pair(StepType::IRREVERSIBLE, "00000003a"),
            ]
        );
    }

    #[test]
    fn fork_switch_undoes_the_abandoned_tail() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        process(&mut f, "00000003b", "00000002a", 0); // sibling, not triggering
        process(&mut f, "00000004b", "00000003b", 0);

        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
                pair(StepType::UNDO, "00000003a"),
                pair(StepType::NEW, "00000003b"),
                pair(StepType::NEW, "00000004b"),
            ]
        );
    }

    #[test]
    fn late_block_below_lib_is_dropped_silently() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000005a"));

        process(&mut f, "00000006a", "00000005a", 5);
        assert_eq!(sink.steps_seen(), vec![pair(StepType::NEW, "00000006a")]);

        process(&mut f, "00000003a", "00000002a", 0);
        assert_eq!(sink.steps_seen().len(), 1);
    }

    #[test]
    fn inclusive_lib_flows_as_new_then_irreversible() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink)
            .with_filters(StepType::NEW | StepType::IRREVERSIBLE)
            .with_inclusive_lib(bref("00000003a"));

        process(&mut f, "00000003a", "00000002a", 3);

        let records = sink.records();
        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000003a"),
                pair(StepType::IRREVERSIBLE, "00000003a"),
            ]
        );
        // The irreversible leg is a one-block segment
        assert_eq!(records[1].step_count, 1);
        assert_eq!(records[1].step_block_ids, vec!["00000003a"]);
        // The new leg is a singleton
        assert_eq!(records[0].step_count, 0);
        assert!(records[0].step_block_ids.is_empty());
    }

    #[test]
    fn without_inclusive_lib_the_anchor_block_stays_silent() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000003a"));

        process(&mut f, "00000003a", "00000002a", 3);
        assert!(sink.steps_seen().is_empty());

        process(&mut f, "00000004a", "00000003a", 3);
        assert_eq!(sink.steps_seen(), vec![pair(StepType::NEW, "00000004a")]);
    }

    #[test]
    fn lib_advance_stalls_the_losing_fork() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        process(&mut f, "00000003b", "00000002a", 0);
        process(&mut f, "00000004a", "00000003a", 3);

        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
                pair(StepType::NEW, "00000004a"),
                pair(StepType::IRREVERSIBLE, "00000002a"),
                pair(StepType::IRREVERSIBLE, "00000003a"),
                pair(StepType::STALLED, "00000003b"),
            ]
        );

        let records = sink.records();
        let irr: Vec<_> = records
            .iter()
            .filter(|r| r.step == StepType::IRREVERSIBLE)
            .collect();
        assert_eq!((irr[0].step_index, irr[0].step_count), (0, 2));
        assert_eq!((irr[1].step_index, irr[1].step_count), (1, 2));
        assert_eq!(irr[0].step_block_ids, vec!["00000002a", "00000003a"]);

        let stalled: Vec<_> = records.iter().filter(|r| r.step == StepType::STALLED).collect();
        assert_eq!((stalled[0].step_index, stalled[0].step_count), (0, 1));
    }

    #[test]
    fn handler_error_on_undo_short_circuits_the_switch() {
        let sink = Arc::new(TestSink::failing_on(StepType::UNDO, "err_undo"));
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        process(&mut f, "00000003b", "00000002a", 0);

        let err = f
            .process_block(Arc::new(StreamBlock::test("00000004b", "00000003b")), None)
            .unwrap_err();

        match &err {
            ForkableError::Handler { block_id, step, .. } => {
                assert_eq!(block_id, "00000003a");
                assert_eq!(*step, StepType::UNDO);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("err_undo"));

        // Nothing on the new branch was flowed
        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
            ]
        );
    }

    #[test]
    fn fork_back_redoes_previously_undone_blocks() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink)
            .with_exclusive_lib(bref("00000001a"))
            .ensure_all_blocks_trigger_longest_chain();

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        // Equal-height sibling wins immediately because every block triggers
        process(&mut f, "00000003b", "00000002a", 0);
        // Back to the a fork: 3a was flowed before, so it is redone
        process(&mut f, "00000004a", "00000003a", 0);

        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
                pair(StepType::UNDO, "00000003a"),
                pair(StepType::NEW, "00000003b"),
                pair(StepType::UNDO, "00000003b"),
                pair(StepType::REDO, "00000003a"),
                pair(StepType::NEW, "00000004a"),
            ]
        );
    }

    #[test]
    fn blocks_never_flowed_are_not_redone() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        process(&mut f, "00000003b", "00000002a", 0); // never flowed
        process(&mut f, "00000004b", "00000003b", 0);

        // The switch to the b fork undid 3a but redid nothing: 3b had
        // never been sent as new, it simply flowed as new
        assert!(!sink.steps_seen().contains(&pair(StepType::REDO, "00000003b")));
    }

    #[test]
    fn duplicate_ingest_emits_nothing() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        let before = sink.steps_seen();

        process(&mut f, "00000003a", "00000002a", 0);
        process(&mut f, "00000002a", "00000001a", 0);
        assert_eq!(sink.steps_seen(), before);
    }

    #[test]
    fn replays_deterministically() {
        let run = || {
            let sink = Arc::new(TestSink::default());
            let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));
            process(&mut f, "00000002a", "00000001a", 0);
            process(&mut f, "00000003b", "00000002a", 0);
            process(&mut f, "00000003a", "00000002a", 0);
            process(&mut f, "00000004a", "00000003a", 2);
            process(&mut f, "00000005a", "00000004a", 3);
            sink.records()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn filter_suppresses_unwanted_kinds_but_keeps_tracking() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink)
            .with_filters(StepType::IRREVERSIBLE)
            .with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 1);
        process(&mut f, "00000003a", "00000002a", 2);
        process(&mut f, "00000004a", "00000003a", 3);

        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::IRREVERSIBLE, "00000002a"),
                pair(StepType::IRREVERSIBLE, "00000003a"),
            ]
        );
    }

    #[test]
    fn ensure_block_flows_holds_emission_until_the_target_arrives() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink)
            .with_filters(StepType::NEW)
            .with_exclusive_lib(bref("00000001a"))
            .ensure_block_flows(bref("00000003a"));

        process(&mut f, "00000002a", "00000001a", 0);
        assert!(sink.steps_seen().is_empty());

        process(&mut f, "00000003a", "00000002a", 0);
        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
            ]
        );

        // Flowed: chain selection is back to the incoming head
        process(&mut f, "00000004a", "00000003a", 0);
        assert_eq!(sink.steps_seen().len(), 3);
        assert_eq!(sink.steps_seen()[2], pair(StepType::NEW, "00000004a"));
    }

    #[test]
    fn fast_path_is_rejected_after_a_lib_move() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink)
            .with_filters(StepType::NEW | StepType::IRREVERSIBLE)
            .with_exclusive_lib(bref("00000001a"));

        // The LIB moves to 2a while the cached chain still starts at 2a;
        // the next ingest must recompute instead of extending the stale
        // cache, or 2a would be replayed
        process(&mut f, "00000002a", "00000001a", 1);
        process(&mut f, "00000003a", "00000002a", 2);
        process(&mut f, "00000004a", "00000003a", 2);
        process(&mut f, "00000005a", "00000004a", 2);

        assert_eq!(
            sink.steps_seen(),
            vec![
                pair(StepType::NEW, "00000002a"),
                pair(StepType::NEW, "00000003a"),
                pair(StepType::IRREVERSIBLE, "00000002a"),
                pair(StepType::NEW, "00000004a"),
                pair(StepType::NEW, "00000005a"),
            ]
        );
    }

    #[test]
    fn emissions_match_canonical_chain_length_above_lib() {
        let sink = Arc::new(TestSink::default());
        let mut f = forkable(&sink).with_exclusive_lib(bref("00000001a"));

        process(&mut f, "00000002a", "00000001a", 0);
        process(&mut f, "00000003a", "00000002a", 0);
        process(&mut f, "00000003b", "00000002a", 0);
        process(&mut f, "00000004b", "00000003b", 0);
        process(&mut f, "00000005b", "00000004b", 2);

        let seen = sink.steps_seen();
        let news = seen.iter().filter(|(s, _)| *s == StepType::NEW).count() as i64;
        let undos = seen.iter().filter(|(s, _)| *s == StepType::UNDO).count() as i64;
        let redos = seen.iter().filter(|(s, _)| *s == StepType::REDO).count() as i64;

        // Canonical chain is 3b..5b above the LIB at 2a: three blocks
        assert_eq!(news - undos + redos, 3 + 1); // +1: 2a flowed before it became the LIB
        assert_eq!(f.fork_db().lib_num(), 2);
    }
}
