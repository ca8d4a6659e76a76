use std::fmt::{Display, Formatter};

/// Sequence number of a block within one direction of a connection. Block ids are assigned
///  monotonically by the sender, starting with the SYN as block 0.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlockId(u64);

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockId {
    pub const ZERO: BlockId = BlockId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> BlockId {
        BlockId(self.0.saturating_add(1))
    }

    pub fn checked_minus(&self, other: u64) -> Option<BlockId> {
        self.0.checked_sub(other).map(BlockId)
    }

    /// The id following `highest`, i.e. the next id that would extend a contiguous prefix.
    ///  `None` stands for 'nothing received yet', so the next id is ZERO.
    pub fn after(highest: Option<BlockId>) -> BlockId {
        highest
            .map(|id| id.next())
            .unwrap_or(BlockId::ZERO)
    }
}
