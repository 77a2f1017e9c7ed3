//! Step taxonomy: the kinds of events the sequencer emits, as a bitset
//! usable both as an event tag and as a subscriber filter mask.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use meander_common::messages::{ForkStep, StepKind};

bitflags! {
    /// Event kinds. Bit assignments are external ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepType: u32 {
        /// First time we're seeing this block
        const NEW = 1;
        /// We are undoing this block (it was done previously)
        const UNDO = 2;
        /// We are redoing this block (it was done previously)
        const REDO = 4;
        /// The block passed a handoff from one producer to another
        const HANDOFF = 8;
        /// This block passed the LIB barrier and is in chain
        const IRREVERSIBLE = 16;
        /// This block passed the LIB and is definitely forked out
        const STALLED = 32;
    }
}

impl StepType {
    /// True when exactly one event kind is set.
    pub fn is_single_step(self) -> bool {
        self.bits().count_ones() == 1
    }

    /// The publishable kind for a single-step value. Handoff is reserved
    /// and never emitted, so it has no kind.
    pub fn kind(self) -> Option<StepKind> {
        if self == Self::NEW {
            Some(StepKind::New)
        } else if self == Self::UNDO {
            Some(StepKind::Undo)
        } else if self == Self::REDO {
            Some(StepKind::Redo)
        } else if self == Self::IRREVERSIBLE {
            Some(StepKind::Irreversible)
        } else if self == Self::STALLED {
            Some(StepKind::Stalled)
        } else {
            None
        }
    }

    /// Build a filter mask from the external step list.
    ///
    /// An empty list means the subscriber did not filter and gets the
    /// default feed. Redo has no external value: it is output into the
    /// new/undo contract, so asking for both new and undo enables it.
    pub fn from_fork_steps(steps: &[ForkStep]) -> StepType {
        if steps.is_empty() {
            return StepType::NEW | StepType::REDO | StepType::UNDO | StepType::IRREVERSIBLE;
        }

        let mut filter = StepType::empty();
        for step in steps {
            filter |= StepType::from(*step);
        }

        if filter.contains(StepType::NEW | StepType::UNDO) {
            filter |= StepType::REDO;
        }

        filter
    }
}

impl From<ForkStep> for StepType {
    fn from(step: ForkStep) -> Self {
        match step {
            ForkStep::New => StepType::NEW,
            ForkStep::Undo => StepType::UNDO,
            ForkStep::Irreversible => StepType::IRREVERSIBLE,
        }
    }
}

const STEP_NAMES: [(StepType, &str); 6] = [
    (StepType::NEW, "new"),
    (StepType::UNDO, "undo"),
    (StepType::REDO, "redo"),
    (StepType::HANDOFF, "handoff"),
    (StepType::IRREVERSIBLE, "irreversible"),
    (StepType::STALLED, "stalled"),
];

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        if *self == StepType::all() {
            return f.write_str("all");
        }

        let mut first = true;
        for (step, name) in STEP_NAMES {
            if self.contains(step) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" | "" => return Ok(StepType::empty()),
            "all" => return Ok(StepType::all()),
            _ => {}
        }

        let mut steps = StepType::empty();
        for token in s.split(',') {
            let token = token.trim();
            let step = STEP_NAMES
                .iter()
                .find(|(_, name)| *name == token)
                .map(|(step, _)| *step)
                .ok_or_else(|| format!("unknown step '{token}'"))?;
            steps |= step;
        }
        Ok(steps)
    }
}
