//! Block allocator consumer interface.
//!
//! The analyzer only describes the work; a `BlockAllocator` implementation
//! actuates it by writing block records and scheduling replication on the
//! agents. The analyzer itself never calls this trait.

use crate::analyzer::{AllocationRequest, BlockInfo};
use async_trait::async_trait;
use chunkio_common::{ObjectId, Result};

/// Consumer of the analyzer's output.
#[async_trait]
pub trait BlockAllocator: Send + Sync {
    /// Allocate one new block for a fragment, replicating from
    /// `request.source` and avoiding the given nodes.
    async fn allocate_block(&self, request: &AllocationRequest, avoid_nodes: &[ObjectId])
        -> Result<()>;

    /// Delete block records and reclaim their storage.
    async fn remove_blocks(&self, blocks: &[BlockInfo]) -> Result<()>;
}
