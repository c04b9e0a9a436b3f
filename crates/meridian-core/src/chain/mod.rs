//! Chain freshness tracking.
//!
//! - [`ChainInfo`]: head and finalized height with the dominance order used to
//!   compare nodes
//! - [`Head`], [`ChainId`]: values reported by endpoints
//! - [`ChainInfoAggregator`]: pool-owned aggregator implementing
//!   [`PoolChainInfoProvider`], publishing the highest-alive and user-observation
//!   watermarks

pub mod aggregator;
pub mod info;

pub use aggregator::{AliveSummary, ChainInfoAggregator, PoolChainInfoProvider};
pub use info::{ChainId, ChainInfo, Head};
