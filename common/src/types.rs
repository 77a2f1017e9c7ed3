//! Core block identity types shared across Meander modules.

use std::fmt;

/// Block identity. The first 8 characters of an id are its block number
/// in hex, a convention inherited from the upstream feeds we consume and
/// relied on by the test-double builders below.
pub type BlockId = String;

/// A cheap reference to a block: its id and number. Identity is the id;
/// the number is carried so ancestry walks can compare heights without a
/// lookup. The empty ref (`id == ""`) is the "not set" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockRef {
    pub id: BlockId,
    pub number: u64,
}

impl BlockRef {
    pub fn new(id: impl Into<BlockId>, number: u64) -> Self {
        Self {
            id: id.into(),
            number,
        }
    }

    /// The "not set" sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    /// Build a ref from an id alone, reading the number from the 8-hex
    /// prefix (`00000003a` is block 3 of fork `a`).
    pub fn from_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            number: number_from_id(id),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

/// A full block as received from the stream. Immutable after ingestion;
/// shared as `Arc<StreamBlock>` between the fork database, step events
/// and bus messages.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamBlock {
    pub id: BlockId,
    pub number: u64,
    pub previous_id: BlockId,

    /// The block's own claim of the highest irreversible block number.
    pub lib_number: u64,

    /// Raw payload carrier, opaque to the sequencer.
    pub payload: Vec<u8>,
}

impl StreamBlock {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.id.clone(), self.number)
    }

    pub fn previous_ref(&self) -> BlockRef {
        BlockRef::new(self.previous_id.clone(), self.number.saturating_sub(1))
    }

    /// Test double: number parsed from the id prefix, no LIB claim.
    pub fn test(id: &str, previous_id: &str) -> Self {
        Self::test_with_lib(id, previous_id, 0)
    }

    /// Test double with an explicit LIB number claim.
    pub fn test_with_lib(id: &str, previous_id: &str, lib_number: u64) -> Self {
        Self {
            id: id.to_string(),
            number: number_from_id(id),
            previous_id: previous_id.to_string(),
            lib_number,
            payload: Vec::new(),
        }
    }
}

impl fmt::Display for StreamBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

/// Parse the 8-hex-character number prefix of a block id. Ids that are
/// too short or not hex-prefixed give 0.
pub fn number_from_id(id: &str) -> u64 {
    id.get(0..8)
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
        .unwrap_or(0)
}
