//! Identifiers shared across the data-exchange layer.
//!
//! Partition and input-channel ids are random 128-bit values so that two
//! executions of the same logical task never collide on the wire or in the
//! partition tracker. Both encode to exactly 16 bytes in protocol frames.

use std::fmt;

use uuid::Uuid;

/// Identifies one produced result partition (one producing task attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultPartitionId(Uuid);

impl ResultPartitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ResultPartitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResultPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0.as_simple())
    }
}

/// Identifies the consumer-side input channel a response is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputChannelId(Uuid);

impl InputChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for InputChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InputChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0.as_simple())
    }
}

/// The contiguous range of subpartition indices one remote request spans.
///
/// A single consumer normally reads one subpartition, but fan-in setups let
/// one request cover several adjacent indices. The range is inclusive and
/// never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpartitionIndexSet {
    start: u32,
    end: u32,
}

impl SubpartitionIndexSet {
    /// Range covering a single subpartition.
    pub fn single(index: u32) -> Self {
        Self {
            start: index,
            end: index,
        }
    }

    /// Inclusive range `[start, end]`. `start` must not exceed `end`.
    pub fn range(start: u32, end: u32) -> Self {
        assert!(start <= end, "empty subpartition index set");
        Self { start, end }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    /// Checks every index is a valid subpartition of a partition with
    /// `num_subpartitions` subpartitions.
    pub fn is_valid_for(&self, num_subpartitions: usize) -> bool {
        (self.end as usize) < num_subpartitions
    }
}
