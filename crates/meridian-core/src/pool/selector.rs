//! Active node selection.
//!
//! Selection runs over plain [`CandidateView`] values copied out of node snapshots,
//! so the ranking rules can be exercised without running nodes.
//!
//! A candidate is eligible when it is `Alive`, its head is within its lag threshold
//! of the highest alive head, and its chain info dominates the pool's user
//! observation watermark. A candidate failing the watermark gate is skipped, never
//! reported as an error.

use crate::{chain::ChainInfo, node::NodeState};
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, fmt, time::Instant};

/// Ranking strategy among eligible nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Lowest `order` wins; ties go to the most recently promoted node, then
    /// round-robin.
    #[default]
    PriorityLevel,
    /// Highest head wins; ties go to the lowest `order`, then round-robin.
    HighestHead,
}

impl SelectionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriorityLevel => "priority_level",
            Self::HighestHead => "highest_head",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection-relevant view of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateView {
    /// Position of the node in the pool.
    pub index: usize,
    pub order: i32,
    pub state: NodeState,
    pub chain_info: ChainInfo,
    pub lag_threshold: u64,
    pub promoted_at: Option<Instant>,
}

impl CandidateView {
    #[inline]
    #[must_use]
    pub fn is_within_lag(&self, highest_alive: ChainInfo) -> bool {
        self.chain_info.block_number.saturating_add(self.lag_threshold) >= highest_alive.block_number
    }

    #[must_use]
    pub fn is_eligible(&self, highest_alive: ChainInfo, watermark: ChainInfo) -> bool {
        self.state == NodeState::Alive &&
            self.is_within_lag(highest_alive) &&
            self.chain_info.dominates(&watermark)
    }
}

/// Stateful selector. Holds the round-robin cursor used to break exact ties.
#[derive(Debug, Default)]
pub struct Selector {
    mode: SelectionMode,
    cursor: usize,
}

impl Selector {
    #[must_use]
    pub fn new(mode: SelectionMode) -> Self {
        Self { mode, cursor: 0 }
    }

    #[must_use]
    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Picks the node that should be active.
    ///
    /// `current` is kept while it stays eligible unless another candidate is strictly
    /// preferred: a lower `order` for [`SelectionMode::PriorityLevel`], or a head
    /// more than `current`'s lag threshold higher for [`SelectionMode::HighestHead`].
    pub fn select(
        &mut self,
        candidates: &[CandidateView],
        highest_alive: ChainInfo,
        watermark: ChainInfo,
        current: Option<usize>,
    ) -> Option<usize> {
        let eligible: Vec<&CandidateView> =
            candidates.iter().filter(|c| c.is_eligible(highest_alive, watermark)).collect();
        if eligible.is_empty() {
            return None;
        }

        let current = current.and_then(|index| eligible.iter().find(|c| c.index == index).copied());

        match self.mode {
            SelectionMode::PriorityLevel => {
                let best_order = eligible.iter().map(|c| c.order).min()?;
                if let Some(current) = current.filter(|c| c.order <= best_order) {
                    return Some(current.index);
                }

                let tier: Vec<&CandidateView> =
                    eligible.into_iter().filter(|c| c.order == best_order).collect();
                let latest = tier.iter().map(|c| c.promoted_at).max()?;
                let tied: Vec<usize> =
                    tier.iter().filter(|c| c.promoted_at == latest).map(|c| c.index).collect();
                Some(self.round_robin(&tied))
            }
            SelectionMode::HighestHead => {
                let top = eligible.iter().map(|c| c.chain_info.block_number).max()?;
                if let Some(current) = current.filter(|c| {
                    c.chain_info.block_number.saturating_add(c.lag_threshold) >= top
                }) {
                    return Some(current.index);
                }

                let tier: Vec<&CandidateView> =
                    eligible.into_iter().filter(|c| c.chain_info.block_number == top).collect();
                let best_order = tier.iter().map(|c| c.order).min()?;
                let tied: Vec<usize> =
                    tier.iter().filter(|c| c.order == best_order).map(|c| c.index).collect();
                Some(self.round_robin(&tied))
            }
        }
    }

    /// Eligible candidates from most to least preferred, without round-robin.
    ///
    /// Used to pick the next node when a call fails over mid-request.
    #[must_use]
    pub fn ranked(
        &self,
        candidates: &[CandidateView],
        highest_alive: ChainInfo,
        watermark: ChainInfo,
    ) -> Vec<usize> {
        let mut eligible: Vec<&CandidateView> =
            candidates.iter().filter(|c| c.is_eligible(highest_alive, watermark)).collect();

        match self.mode {
            SelectionMode::PriorityLevel => {
                eligible.sort_by_key(|c| (c.order, Reverse(c.promoted_at), c.index));
            }
            SelectionMode::HighestHead => {
                eligible.sort_by_key(|c| (Reverse(c.chain_info.block_number), c.order, c.index));
            }
        }
        eligible.into_iter().map(|c| c.index).collect()
    }

    fn round_robin(&mut self, tied: &[usize]) -> usize {
        if tied.len() == 1 {
            return tied[0];
        }
        let pick = tied[self.cursor % tied.len()];
        self.cursor = self.cursor.wrapping_add(1);
        pick
    }
}
