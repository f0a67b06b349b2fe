//! # Copy-on-Write B+Tree
//!
//! The tree layer: in-memory nodes materialized from committed pages, and
//! the per-transaction shadow pager that rebalances, splits, and assigns
//! final page ids to dirty nodes at commit time.
//!
//! - `node`: entry codec, in-place page lookups, split-point selection
//! - `pager`: dirty-node arena, commit spill, shadow buffer writes

mod node;
mod pager;

pub use node::{branch_lookup, leaf_lookup, span_for, Entry, Node};
pub use pager::{ShadowPager, SpillCtx};
