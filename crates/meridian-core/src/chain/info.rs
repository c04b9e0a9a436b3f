//! Chain freshness values and the dominance order over them.

use crate::types::Hash32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric chain identifier an endpoint must report (e.g. `1` for Ethereum mainnet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A single head notification from an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Head {
    pub number: u64,
    pub hash: Hash32,
    pub parent_hash: Hash32,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
}

impl Head {
    /// Creates a head with only the height set.
    #[must_use]
    pub fn at(number: u64) -> Self {
        Self { number, ..Self::default() }
    }
}

/// Height and finality snapshot used to compare freshness between nodes.
///
/// `ChainInfo` values form a partial order: `a` dominates `b` when `a` is at least
/// as fresh as `b` on both the head height and the finalized height. Two values where
/// each is ahead on a different axis are incomparable; [`ChainInfo::join`] gives the
/// least value dominating both.
///
/// # Example
///
/// ```
/// use meridian_core::chain::ChainInfo;
///
/// let a = ChainInfo::new(105, 90);
/// let b = ChainInfo::new(100, 95);
///
/// assert!(!a.dominates(&b));
/// assert!(!b.dominates(&a));
/// assert_eq!(a.join(b), ChainInfo::new(105, 95));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChainInfo {
    pub block_number: u64,
    pub finalized_block_number: u64,
}

impl ChainInfo {
    #[must_use]
    pub const fn new(block_number: u64, finalized_block_number: u64) -> Self {
        Self { block_number, finalized_block_number }
    }

    /// Returns `true` if `self` is at least as fresh as `other` on both axes.
    #[inline]
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        self.block_number >= other.block_number &&
            self.finalized_block_number >= other.finalized_block_number
    }

    /// Returns `true` if `self` dominates `other` and is ahead on at least one axis.
    #[inline]
    #[must_use]
    pub fn strictly_dominates(&self, other: &Self) -> bool {
        self.dominates(other) && self != other
    }

    /// Component-wise maximum.
    #[inline]
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        Self {
            block_number: self.block_number.max(other.block_number),
            finalized_block_number: self.finalized_block_number.max(other.finalized_block_number),
        }
    }

    /// Number of blocks `self` trails `other` by, zero when not behind.
    #[inline]
    #[must_use]
    pub fn blocks_behind(&self, other: &Self) -> u64 {
        other.block_number.saturating_sub(self.block_number)
    }
}

impl fmt::Display for ChainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "head={} finalized={}", self.block_number, self.finalized_block_number)
    }
}
