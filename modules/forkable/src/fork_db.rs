//! In-memory fork database: the DAG of volatile blocks keyed by id.
//!
//! Tracks the Last Irreversible Block and answers the ancestry queries
//! the sequencer needs: the reversible segment behind a head, the
//! undo/redo paths of a chain switch, and the irreversible/stalled
//! split when the LIB advances. Back-edges are id keys plus a parallel
//! number map; walks are iterative and pruning on LIB moves keeps
//! occupancy bounded by the reversible depth times the branching factor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use meander_common::{BlockId, BlockRef, StreamBlock};
use tracing::debug;

/// A block plus the opaque object attached to it at ingestion, as handed
/// to the handler. `O` is the preprocessed-object type of the stream.
#[derive(Debug)]
pub struct PreparedBlock<O> {
    pub block: Arc<StreamBlock>,
    pub obj: Option<Arc<O>>,
}

impl<O> Clone for PreparedBlock<O> {
    fn clone(&self) -> Self {
        Self {
            block: self.block.clone(),
            obj: self.obj.clone(),
        }
    }
}

/// A position on a chain, as returned by segment queries. Objects are
/// re-resolved through [`ForkDB::block_for_id`] at emission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub id: BlockId,
    pub number: u64,
}

/// Edge of the fork tree: child id maps to this.
struct Link<O> {
    previous_id: BlockId,
    prepared: PreparedBlock<O>,

    /// Set once the sequencer has flowed this block as new.
    sent_as_new: bool,
}

/// The fork database. Single-owner; the sequencer drives it and hands
/// read access to the handler for the duration of each synchronous call.
pub struct ForkDB<O> {
    /// The entire DAG: block id to its parent edge and payload.
    links: HashMap<BlockId, Link<O>>,

    /// Block numbers by id, including parents we only know by reference.
    nums: HashMap<BlockId, u64>,

    /// Last Irreversible Block; empty until established.
    lib_ref: BlockRef,
}

impl<O> Default for ForkDB<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> ForkDB<O> {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            nums: HashMap::new(),
            lib_ref: BlockRef::empty(),
        }
    }

    pub fn has_lib(&self) -> bool {
        !self.lib_ref.is_empty()
    }

    pub fn lib_id(&self) -> &str {
        &self.lib_ref.id
    }

    /// 0 until a LIB is established.
    pub fn lib_num(&self) -> u64 {
        self.lib_ref.number
    }

    pub fn lib_ref(&self) -> &BlockRef {
        &self.lib_ref
    }

    /// Number of blocks currently linked.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Set the LIB to a known irreversible anchor, without requiring the
    /// block itself to be present.
    pub fn init_lib(&mut self, lib: BlockRef) {
        self.lib_ref = lib;
    }

    /// Add an edge to the tree. Returns true (and changes nothing) if the
    /// block id is already present.
    pub fn add_link(
        &mut self,
        block: &Arc<StreamBlock>,
        previous: &BlockRef,
        obj: Option<Arc<O>>,
    ) -> bool {
        if self.links.contains_key(&block.id) {
            return true;
        }

        self.nums.insert(block.id.clone(), block.number);
        self.nums.insert(previous.id.clone(), previous.number);
        self.links.insert(
            block.id.clone(),
            Link {
                previous_id: previous.id.clone(),
                prepared: PreparedBlock {
                    block: block.clone(),
                    obj,
                },
                sent_as_new: false,
            },
        );
        false
    }

    /// Try to establish the LIB at `lib_num` by searching the ancestry of
    /// `head`. `previous` covers the first hop, so a parent we have never
    /// linked can still anchor the LIB. No-op when nothing is found.
    pub fn try_set_lib(&mut self, head: &BlockRef, previous: &BlockRef, lib_num: u64) {
        if self.has_lib() {
            return;
        }

        match self.block_in_chain(head, previous, lib_num) {
            Some(lib) => self.move_lib(lib),
            None => debug!(
                head = %head,
                lib_num,
                "cannot find block at lib_num in ancestry, lib not set"
            ),
        }
    }

    /// Ancestry search from `head` for the block at exactly `target_num`,
    /// using `first_previous` for the hop below `head` itself.
    fn block_in_chain(
        &self,
        head: &BlockRef,
        first_previous: &BlockRef,
        target_num: u64,
    ) -> Option<BlockRef> {
        if target_num > head.number {
            return None;
        }
        if head.number == target_num {
            return Some(head.clone());
        }

        let mut cur = first_previous.clone();
        loop {
            if cur.number == target_num {
                return Some(cur);
            }
            if cur.number < target_num {
                return None;
            }
            let link = self.links.get(&cur.id)?;
            let prev_num = *self.nums.get(&link.previous_id)?;
            cur = BlockRef::new(link.previous_id.clone(), prev_num);
        }
    }

    /// Walk the current chain down from `head` to the block at exactly
    /// `target_num`. Empty when the ancestry breaks first.
    pub fn block_in_current_chain(&self, head: &BlockRef, target_num: u64) -> Option<BlockRef> {
        let mut cur = head.clone();
        loop {
            if cur.number == target_num {
                return Some(cur);
            }
            if cur.number < target_num {
                return None;
            }
            let link = self.links.get(&cur.id)?;
            let prev_num = *self.nums.get(&link.previous_id)?;
            cur = BlockRef::new(link.previous_id.clone(), prev_num);
        }
    }

    /// The ordered path from LIB+1 up to and including `head` - but only
    /// if the ancestry walk actually reaches the LIB. A broken walk gives
    /// an empty segment, meaning "not ready yet".
    pub fn reversible_segment(&self, head: &BlockRef) -> Vec<ChainBlock> {
        let lib_num = self.lib_num();
        let mut segment = Vec::new();

        let mut cur = head.clone();
        loop {
            if cur.id == self.lib_ref.id {
                break;
            }
            if cur.number <= lib_num {
                debug!(
                    head = %head,
                    stopped_at = %cur,
                    lib = %self.lib_ref,
                    "reversible segment walked below lib without reaching it"
                );
                return Vec::new();
            }

            let Some(link) = self.links.get(&cur.id) else {
                debug!(head = %head, missing = %cur, "reversible segment broken, missing link");
                return Vec::new();
            };
            segment.push(ChainBlock {
                id: cur.id.clone(),
                number: cur.number,
            });

            let Some(prev_num) = self.nums.get(&link.previous_id) else {
                debug!(head = %head, missing = %link.previous_id, "reversible segment broken, unknown parent number");
                return Vec::new();
            };
            cur = BlockRef::new(link.previous_id.clone(), *prev_num);
        }

        segment.reverse();
        segment
    }

    /// The undo and redo paths of a switch from `old_head_id` to a new
    /// head whose parent is `new_head_previous_id`. Undo ids run from the
    /// old head down to the child of the junction; redo ids run from the
    /// child of the junction up to the new head's parent. Both are empty
    /// when the two refer to the same block, or when no junction can be
    /// found in the tree.
    pub fn chain_switch_segments(
        &self,
        old_head_id: &str,
        new_head_previous_id: &str,
    ) -> (Vec<BlockId>, Vec<BlockId>) {
        if old_head_id == new_head_previous_id {
            return (Vec::new(), Vec::new());
        }

        let mut undo_chain: Vec<BlockId> = Vec::new();
        let mut seen: HashSet<BlockId> = HashSet::new();
        let mut cur = old_head_id.to_string();
        loop {
            undo_chain.push(cur.clone());
            seen.insert(cur.clone());
            match self.links.get(&cur) {
                Some(link) if !link.previous_id.is_empty() => cur = link.previous_id.clone(),
                _ => break,
            }
        }

        let mut redo_chain: Vec<BlockId> = Vec::new();
        let mut cur = new_head_previous_id.to_string();
        let junction = loop {
            if seen.contains(&cur) {
                break cur;
            }
            redo_chain.push(cur.clone());
            match self.links.get(&cur) {
                Some(link) if !link.previous_id.is_empty() => cur = link.previous_id.clone(),
                _ => {
                    // No common point, probably unlinked
                    debug!(
                        old_head_id,
                        new_head_previous_id, "no junction found between chains"
                    );
                    return (Vec::new(), Vec::new());
                }
            }
        };

        let undo: Vec<BlockId> =
            undo_chain.into_iter().take_while(|id| *id != junction).collect();
        redo_chain.reverse();
        (undo, redo_chain)
    }

    /// Compare `new_lib` against the current LIB. When it is higher,
    /// return the irreversible path (LIB+1 up to and including the new
    /// LIB, ascending) and the stalled blocks (everything else linked in
    /// that number range, ascending, ties broken by id).
    pub fn has_new_irreversible_segment(
        &self,
        new_lib: &BlockRef,
    ) -> Option<(Vec<ChainBlock>, Vec<ChainBlock>)> {
        let cur_lib_num = self.lib_num();
        if new_lib.number <= cur_lib_num {
            return None;
        }

        let mut irreversible = Vec::new();
        let mut cur = new_lib.clone();
        while cur.number > cur_lib_num {
            let Some(link) = self.links.get(&cur.id) else {
                debug!(new_lib = %new_lib, missing = %cur, "irreversible segment broken, missing link");
                return None;
            };
            irreversible.push(ChainBlock {
                id: cur.id.clone(),
                number: cur.number,
            });
            let Some(prev_num) = self.nums.get(&link.previous_id) else {
                debug!(new_lib = %new_lib, missing = %link.previous_id, "irreversible segment broken, unknown parent number");
                return None;
            };
            cur = BlockRef::new(link.previous_id.clone(), *prev_num);
        }
        irreversible.reverse();

        let on_path: HashSet<&BlockId> = irreversible.iter().map(|b| &b.id).collect();
        let mut stalled: Vec<ChainBlock> = self
            .links
            .iter()
            .filter(|(id, link)| {
                let num = link.prepared.block.number;
                num > cur_lib_num && num <= new_lib.number && !on_path.contains(id)
            })
            .map(|(id, link)| ChainBlock {
                id: id.clone(),
                number: link.prepared.block.number,
            })
            .collect();
        stalled.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.id.cmp(&b.id)));

        Some((irreversible, stalled))
    }

    /// Advance the LIB and prune everything at or below it, keeping only
    /// the LIB block itself as the anchor of future walks.
    pub fn move_lib(&mut self, lib: BlockRef) {
        let lib_num = lib.number;
        self.links
            .retain(|id, link| link.prepared.block.number > lib_num || *id == lib.id);

        let mut keep: HashSet<BlockId> = HashSet::with_capacity(self.links.len() * 2);
        for (id, link) in &self.links {
            keep.insert(id.clone());
            keep.insert(link.previous_id.clone());
        }
        keep.insert(lib.id.clone());
        self.nums.retain(|id, _| keep.contains(id));

        self.lib_ref = lib;
    }

    /// Direct lookup of a linked block and its attached object.
    pub fn block_for_id(&self, id: &str) -> Option<&PreparedBlock<O>> {
        self.links.get(id).map(|link| &link.prepared)
    }

    /// Whether the block has already flowed as new.
    pub fn is_sent_as_new(&self, id: &str) -> bool {
        self.links.get(id).is_some_and(|link| link.sent_as_new)
    }

    /// Record that the block has flowed as new.
    pub fn mark_sent_as_new(&mut self, id: &str) {
        if let Some(link) = self.links.get_mut(id) {
            link.sent_as_new = true;
        }
    }
}
