//! ChunkIO Placement - chunk health analysis and repair planning
//!
//! This crate decides how a chunk's replicated blocks converge toward the
//! configured replica target. Given a chunk, its known blocks (with hydrated
//! node state) and the pool set derived from the bucket's tiering policy, the
//! analyzer classifies every block by liveness, computes per-fragment and
//! chunk health, and produces the lists of blocks to remove and of new blocks
//! to allocate (each with a replication source).
//!
//! The analyzer is a pure function: it performs no I/O and never suspends.
//! Actuation of its output is the block allocator's job.
//!
//! # Example
//! ```ignore
//! use chunkio_placement::{analyze_chunk, pools_groups};
//!
//! let groups = pools_groups(&tier_spec);
//! let analysis = analyze_chunk(&chunk, &blocks, &groups, Utc::now(), &config);
//! allocator.remove_blocks(&analysis.blocks_to_remove).await?;
//! ```

pub mod allocator;
pub mod analyzer;
pub mod groups;

pub use allocator::BlockAllocator;
pub use analyzer::{
    analyze_chunk, classify_block, AllocationRequest, BlockClass, BlockInfo, ChunkAnalysis,
    ChunkHealth, ChunkInfo, FragHealth, FragStatus, NodeInfo,
};
pub use groups::{flatten_groups, pools_groups};
