//! B+ tree page model
//!
//! This module owns everything about a single page: the in-memory shape of
//! leaves and nodes, how records and separators are placed inside them, how
//! they are encoded for the backing store, and the recency cache that holds
//! them between loads. Walking and restructuring the tree as a whole is the
//! job of [`crate::database`].
//!
//! Leaves hold sorted records and form a doubly linked chain in key order.
//! Nodes hold a leftmost child (the heir) plus sorted separators, each
//! pointing at the child whose keys start at that separator.

mod cache;
mod error;
mod node;
pub mod serialization;

pub use cache::PageCache;
pub use error::{PageError, PageResult};
pub use node::{AddOutcome, DupMode, Index, LeafId, LeafPage, NodeId, NodePage, PageId, Record};

/// Smallest leaf ID
pub const LEAF_ID_MIN: u32 = 1;

/// Smallest node ID; everything below is a leaf
pub const NODE_ID_MIN: u32 = 100_000_000;

/// Deepest tree the navigator will walk before declaring the file broken
pub const LEVEL_MAX: usize = 64;

/// Pages written back per eviction round
pub const CACHE_OUT: usize = 8;
