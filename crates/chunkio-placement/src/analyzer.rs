//! Chunk placement analyzer
//!
//! Classifies a chunk's blocks by node liveness, derives per-fragment and
//! chunk health, and plans the removals and allocations that converge the
//! chunk toward the replica target. All inputs are fully hydrated (node pool,
//! heartbeat and service mode resolved) before invocation; the analyzer
//! itself performs no I/O.

use crate::groups::flatten_groups;
use chrono::{DateTime, Utc};
use chunkio_common::{FragLayer, ObjectId, PlacementConfig, ServiceMode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node state relevant to placement, resolved from the node's pool record
/// and latest heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier
    pub id: ObjectId,
    /// Pool the node belongs to
    pub pool: ObjectId,
    /// Most recent liveness timestamp
    pub heartbeat: DateTime<Utc>,
    /// Service mode; `None` means the node serves normally
    pub srvmode: Option<ServiceMode>,
}

/// One physical replica of a fragment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block identifier
    pub id: ObjectId,
    /// Fragment layer this block replicates
    pub layer: FragLayer,
    /// Fragment index within the layer
    pub frag: u32,
    /// Hydrated node state
    pub node: NodeInfo,
    /// Set while the replica is still being written; cleared on completion
    pub building: Option<DateTime<Utc>>,
}

/// The chunk under analysis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Chunk identifier
    pub id: ObjectId,
    /// Owning system
    pub system: ObjectId,
    /// Tier the chunk is placed on
    pub tier: ObjectId,
    /// Chunk size in bytes
    pub size: u64,
    /// Number of data fragments
    pub data_frags: u32,
}

/// Liveness classification of a single block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockClass {
    /// Node unseen for a long time, or disabled; the block is lost
    LongGone,
    /// Node unseen recently; the block gets a grace period
    ShortGone,
    /// Replica write started long ago and never finished
    LongBuilding,
    /// Replica write in progress
    Building,
    /// Live replica on a normally serving node
    Good,
    /// Live replica on a draining node; readable but not counted as good
    Decommissioning,
}

impl BlockClass {
    /// Whether a block of this class can serve as a replication source
    #[must_use]
    pub fn is_accessible(&self) -> bool {
        matches!(self, Self::Good | Self::Decommissioning)
    }
}

/// Health of a single fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragHealth {
    /// Replica target met
    Healthy,
    /// Below the replica target but repairable
    Repairing,
    /// No accessible replica remains
    Unavailable,
}

/// Health of the whole chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkHealth {
    /// Every fragment has at least one accessible replica
    Available,
    /// Some fragment has no accessible replica
    Unavailable,
}

/// Per-fragment classification result.
///
/// The class lists preserve access-priority order: freshest heartbeat first,
/// blocks on nodes with a service mode set after those without, unfinished
/// blocks last.
#[derive(Clone, Debug)]
pub struct FragStatus {
    /// Fragment layer
    pub layer: FragLayer,
    /// Fragment index
    pub frag: u32,
    /// Live replicas counting toward the target
    pub good: Vec<BlockInfo>,
    /// Replicas in the short-gone grace period
    pub short_gone: Vec<BlockInfo>,
    /// Lost replicas
    pub long_gone: Vec<BlockInfo>,
    /// Replicas still being written
    pub building: Vec<BlockInfo>,
    /// Abandoned replica writes
    pub long_building: Vec<BlockInfo>,
    /// Replicas on draining nodes
    pub decommissioning: Vec<BlockInfo>,
    /// Usable replication sources, including blocks outside the target pool
    /// set
    pub accessible: Vec<BlockInfo>,
    /// Health verdict for this fragment
    pub health: FragHealth,
}

impl FragStatus {
    fn new(layer: FragLayer, frag: u32) -> Self {
        Self {
            layer,
            frag,
            good: Vec::new(),
            short_gone: Vec::new(),
            long_gone: Vec::new(),
            building: Vec::new(),
            long_building: Vec::new(),
            decommissioning: Vec::new(),
            accessible: Vec::new(),
            health: FragHealth::Healthy,
        }
    }

    fn class_list_mut(&mut self, class: BlockClass) -> &mut Vec<BlockInfo> {
        match class {
            BlockClass::Good => &mut self.good,
            BlockClass::ShortGone => &mut self.short_gone,
            BlockClass::LongGone => &mut self.long_gone,
            BlockClass::Building => &mut self.building,
            BlockClass::LongBuilding => &mut self.long_building,
            BlockClass::Decommissioning => &mut self.decommissioning,
        }
    }
}

/// A request to allocate one new block, handed to the block allocator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Owning system
    pub system: ObjectId,
    /// Target tier
    pub tier: ObjectId,
    /// Chunk to replicate
    pub chunk: ObjectId,
    /// Fragment layer
    pub layer: FragLayer,
    /// Fragment index
    pub frag: u32,
    /// Block to replicate from
    pub source: BlockInfo,
}

/// Full analysis of one chunk against a target pool set.
#[derive(Clone, Debug)]
pub struct ChunkAnalysis {
    /// The analyzed chunk
    pub chunk: ChunkInfo,
    /// Blocks residing on the target pool set
    pub all_blocks: Vec<BlockInfo>,
    /// Per-fragment classification
    pub frags: Vec<FragStatus>,
    /// Allocation requests that bring fragments back to the replica target
    pub blocks_to_allocate: Vec<AllocationRequest>,
    /// Blocks to delete: lost, abandoned, and surplus replicas
    pub blocks_to_remove: Vec<BlockInfo>,
    /// Aggregate chunk health
    pub chunk_health: ChunkHealth,
}

fn age(now: DateTime<Utc>, ts: DateTime<Utc>) -> Duration {
    // A timestamp in the future counts as age zero.
    (now - ts).to_std().unwrap_or(Duration::ZERO)
}

/// Classify one block by node liveness at `now`.
///
/// The checks are ordered: a disabled or long-unseen node wins over
/// everything else, then the short-gone grace period, then build state, and
/// only a normally serving node yields a good block.
#[must_use]
pub fn classify_block(block: &BlockInfo, now: DateTime<Utc>, cfg: &PlacementConfig) -> BlockClass {
    let heartbeat_age = age(now, block.node.heartbeat);
    if heartbeat_age > cfg.long_gone_threshold || block.node.srvmode == Some(ServiceMode::Disabled)
    {
        BlockClass::LongGone
    } else if heartbeat_age > cfg.short_gone_threshold {
        BlockClass::ShortGone
    } else if let Some(started) = block.building {
        if age(now, started) > cfg.long_build_threshold {
            BlockClass::LongBuilding
        } else {
            BlockClass::Building
        }
    } else if block.node.srvmode.is_none() {
        BlockClass::Good
    } else {
        BlockClass::Decommissioning
    }
}

/// Order blocks by access priority: finished before building, normally
/// serving nodes before nodes with a service mode set, then freshest
/// heartbeat first. `sort_by` is stable, so equal blocks keep their input
/// order and repeated analysis of the same input makes the same decisions.
fn sort_by_access(blocks: &mut [BlockInfo]) {
    blocks.sort_by(|a, b| {
        a.building
            .is_some()
            .cmp(&b.building.is_some())
            .then_with(|| a.node.srvmode.is_some().cmp(&b.node.srvmode.is_some()))
            .then_with(|| b.node.heartbeat.cmp(&a.node.heartbeat))
    });
}

/// Analyze one chunk against the pool groups derived from its bucket's tier.
///
/// The groups are flattened into a single target pool set; blocks on pools
/// outside the set never count toward the replica target but still serve as
/// replication sources. Removal is conservative: lost and abandoned blocks
/// are only deleted once the fragment holds a surplus of good replicas, and
/// short-gone blocks are never deleted.
#[must_use]
pub fn analyze_chunk(
    chunk: &ChunkInfo,
    allocated_blocks: &[BlockInfo],
    pool_groups: &[Vec<ObjectId>],
    now: DateTime<Utc>,
    cfg: &PlacementConfig,
) -> ChunkAnalysis {
    let pool_set = flatten_groups(pool_groups);
    let (policy_blocks, other_blocks): (Vec<BlockInfo>, Vec<BlockInfo>) = allocated_blocks
        .iter()
        .cloned()
        .partition(|block| pool_set.contains(&block.node.pool));

    // The target pool set holds no replica of this chunk at all; every
    // fragment must receive a full mirror sourced from outside the set.
    let mirrored_pool = policy_blocks.is_empty();

    let mut frags = Vec::with_capacity(chunk.data_frags as usize);
    let mut blocks_to_remove = Vec::new();
    let mut blocks_to_allocate = Vec::new();
    let mut chunk_health = ChunkHealth::Available;

    for frag in 0..chunk.data_frags {
        let mut status = FragStatus::new(FragLayer::D, frag);

        let mut frag_blocks: Vec<BlockInfo> = policy_blocks
            .iter()
            .filter(|block| block.layer == FragLayer::D && block.frag == frag)
            .cloned()
            .collect();
        sort_by_access(&mut frag_blocks);

        for block in frag_blocks {
            let class = classify_block(&block, now, cfg);
            if class.is_accessible() {
                status.accessible.push(block.clone());
            }
            status.class_list_mut(class).push(block);
        }

        let mut outside: Vec<BlockInfo> = other_blocks
            .iter()
            .filter(|block| block.layer == FragLayer::D && block.frag == frag)
            .cloned()
            .collect();
        sort_by_access(&mut outside);

        for block in outside {
            if classify_block(&block, now, cfg).is_accessible() {
                status.accessible.push(block);
            }
        }

        let good = status.good.len();
        status.health = if status.accessible.is_empty() {
            chunk_health = ChunkHealth::Unavailable;
            FragHealth::Unavailable
        } else if good < cfg.optimal_replicas || mirrored_pool {
            FragHealth::Repairing
        } else {
            FragHealth::Healthy
        };

        if good > cfg.optimal_replicas {
            blocks_to_remove.extend(status.long_building.iter().cloned());
            blocks_to_remove.extend(status.long_gone.iter().cloned());
            blocks_to_remove.extend(status.good[cfg.optimal_replicas..].iter().cloned());
        }

        if status.health == FragHealth::Repairing {
            let missing = cfg.optimal_replicas.saturating_sub(good);
            for i in 0..missing {
                let source = status.accessible[i % status.accessible.len()].clone();
                blocks_to_allocate.push(AllocationRequest {
                    system: chunk.system,
                    tier: chunk.tier,
                    chunk: chunk.id,
                    layer: FragLayer::D,
                    frag,
                    source,
                });
            }
        }

        frags.push(status);
    }

    ChunkAnalysis {
        chunk: chunk.clone(),
        all_blocks: policy_blocks,
        frags,
        blocks_to_allocate,
        blocks_to_remove,
        chunk_health,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn test_config() -> PlacementConfig {
        PlacementConfig::default()
    }

    fn make_node(pool: ObjectId, heartbeat_age: Duration, srvmode: Option<ServiceMode>) -> NodeInfo {
        NodeInfo {
            id: ObjectId::new(),
            pool,
            heartbeat: test_now() - chrono::Duration::from_std(heartbeat_age).unwrap(),
            srvmode,
        }
    }

    fn make_block(frag: u32, node: NodeInfo) -> BlockInfo {
        BlockInfo {
            id: ObjectId::new(),
            layer: FragLayer::D,
            frag,
            node,
            building: None,
        }
    }

    fn make_chunk(data_frags: u32) -> ChunkInfo {
        ChunkInfo {
            id: ObjectId::new(),
            system: ObjectId::new(),
            tier: ObjectId::new(),
            size: 4 * 1024 * 1024,
            data_frags,
        }
    }

    const FRESH: Duration = Duration::from_secs(10);

    #[test]
    fn test_classify_block() {
        let cfg = test_config();
        let pool = ObjectId::new();

        let good = make_block(0, make_node(pool, FRESH, None));
        assert_eq!(classify_block(&good, test_now(), &cfg), BlockClass::Good);

        let short_gone = make_block(0, make_node(pool, Duration::from_secs(10 * 60), None));
        assert_eq!(
            classify_block(&short_gone, test_now(), &cfg),
            BlockClass::ShortGone
        );

        let long_gone = make_block(0, make_node(pool, Duration::from_secs(4 * 24 * 60 * 60), None));
        assert_eq!(
            classify_block(&long_gone, test_now(), &cfg),
            BlockClass::LongGone
        );

        // A disabled node is long gone even with a fresh heartbeat.
        let disabled = make_block(0, make_node(pool, FRESH, Some(ServiceMode::Disabled)));
        assert_eq!(
            classify_block(&disabled, test_now(), &cfg),
            BlockClass::LongGone
        );

        let decommissioning =
            make_block(0, make_node(pool, FRESH, Some(ServiceMode::Decommissioning)));
        assert_eq!(
            classify_block(&decommissioning, test_now(), &cfg),
            BlockClass::Decommissioning
        );
        assert!(classify_block(&decommissioning, test_now(), &cfg).is_accessible());

        let mut building = make_block(0, make_node(pool, FRESH, None));
        building.building = Some(test_now() - chrono::Duration::minutes(1));
        assert_eq!(
            classify_block(&building, test_now(), &cfg),
            BlockClass::Building
        );
        assert!(!classify_block(&building, test_now(), &cfg).is_accessible());

        let mut long_building = make_block(0, make_node(pool, FRESH, None));
        long_building.building = Some(test_now() - chrono::Duration::minutes(30));
        assert_eq!(
            classify_block(&long_building, test_now(), &cfg),
            BlockClass::LongBuilding
        );
    }

    #[test]
    fn test_access_sort_order_and_stability() {
        let pool = ObjectId::new();
        let fresh = make_block(0, make_node(pool, FRESH, None));
        let stale = make_block(0, make_node(pool, Duration::from_secs(60), None));
        let draining = make_block(0, make_node(pool, FRESH, Some(ServiceMode::Decommissioning)));
        let mut building = make_block(0, make_node(pool, FRESH, None));
        building.building = Some(test_now());

        let mut blocks = vec![
            building.clone(),
            draining.clone(),
            stale.clone(),
            fresh.clone(),
        ];
        sort_by_access(&mut blocks);
        assert_eq!(
            blocks.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![fresh.id, stale.id, draining.id, building.id]
        );

        // Equal keys keep input order.
        let twin_a = make_block(0, make_node(pool, FRESH, None));
        let mut twin_b = twin_a.clone();
        twin_b.id = ObjectId::new();
        let mut twins = vec![twin_a.clone(), twin_b.clone()];
        sort_by_access(&mut twins);
        assert_eq!(twins[0].id, twin_a.id);
        assert_eq!(twins[1].id, twin_b.id);
    }

    #[test]
    fn test_healthy_chunk() {
        // Three fresh replicas on the target pool: nothing to do.
        let cfg = test_config();
        let pool = ObjectId::new();
        let chunk = make_chunk(1);
        let blocks: Vec<BlockInfo> = (0..3)
            .map(|_| make_block(0, make_node(pool, FRESH, None)))
            .collect();

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![pool]], test_now(), &cfg);

        assert_eq!(analysis.frags.len(), 1);
        assert_eq!(analysis.frags[0].health, FragHealth::Healthy);
        assert_eq!(analysis.chunk_health, ChunkHealth::Available);
        assert!(analysis.blocks_to_remove.is_empty());
        assert!(analysis.blocks_to_allocate.is_empty());
        assert_eq!(analysis.all_blocks.len(), 3);
    }

    #[test]
    fn test_repair_one_missing_replica() {
        // Two good plus one short-gone: allocate one, remove nothing.
        let cfg = test_config();
        let pool = ObjectId::new();
        let chunk = make_chunk(1);
        let blocks = vec![
            make_block(0, make_node(pool, FRESH, None)),
            make_block(0, make_node(pool, FRESH, None)),
            make_block(0, make_node(pool, Duration::from_secs(10 * 60), None)),
        ];

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![pool]], test_now(), &cfg);

        assert_eq!(analysis.frags[0].health, FragHealth::Repairing);
        assert_eq!(analysis.frags[0].good.len(), 2);
        assert_eq!(analysis.frags[0].short_gone.len(), 1);
        assert!(analysis.blocks_to_remove.is_empty());
        assert_eq!(analysis.blocks_to_allocate.len(), 1);
        // Source is the freshest good block, never the short-gone one.
        assert_eq!(
            analysis.blocks_to_allocate[0].source.id,
            analysis.frags[0].good[0].id
        );
        assert_eq!(analysis.blocks_to_allocate[0].chunk, chunk.id);
    }

    #[test]
    fn test_surplus_triggers_trim_of_stale_blocks() {
        // Five good, one long-gone, one long-building: surplus allows
        // trimming the stale blocks plus the two extra good ones.
        let cfg = test_config();
        let pool = ObjectId::new();
        let chunk = make_chunk(1);

        let good: Vec<BlockInfo> = (0..5)
            .map(|i| make_block(0, make_node(pool, Duration::from_secs(i), None)))
            .collect();
        let long_gone = make_block(0, make_node(pool, Duration::from_secs(4 * 24 * 60 * 60), None));
        let mut long_building = make_block(0, make_node(pool, FRESH, None));
        long_building.building = Some(test_now() - chrono::Duration::hours(1));

        let mut blocks = good.clone();
        blocks.push(long_gone.clone());
        blocks.push(long_building.clone());

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![pool]], test_now(), &cfg);

        assert_eq!(analysis.frags[0].health, FragHealth::Healthy);
        assert!(analysis.blocks_to_allocate.is_empty());

        let removed: Vec<ObjectId> = analysis.blocks_to_remove.iter().map(|b| b.id).collect();
        assert_eq!(removed.len(), 4);
        assert!(removed.contains(&long_gone.id));
        assert!(removed.contains(&long_building.id));
        // The surplus good blocks are the lowest-priority ones (oldest
        // heartbeats).
        assert!(removed.contains(&good[3].id));
        assert!(removed.contains(&good[4].id));
    }

    #[test]
    fn test_all_blocks_gone_is_unavailable() {
        let cfg = test_config();
        let pool = ObjectId::new();
        let chunk = make_chunk(1);
        let blocks: Vec<BlockInfo> = (0..3)
            .map(|_| make_block(0, make_node(pool, Duration::from_secs(5 * 24 * 60 * 60), None)))
            .collect();

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![pool]], test_now(), &cfg);

        assert_eq!(analysis.frags[0].health, FragHealth::Unavailable);
        assert_eq!(analysis.chunk_health, ChunkHealth::Unavailable);
        assert!(analysis.blocks_to_allocate.is_empty());
        assert!(analysis.blocks_to_remove.is_empty());
    }

    #[test]
    fn test_unpopulated_pool_receives_full_mirror() {
        // All replicas live outside the target pool set: allocate a full
        // replica set, sources drawn round-robin from the outside blocks.
        let cfg = test_config();
        let target_pool = ObjectId::new();
        let outside_pool = ObjectId::new();
        let chunk = make_chunk(1);
        let blocks = vec![
            make_block(0, make_node(outside_pool, Duration::from_secs(1), None)),
            make_block(0, make_node(outside_pool, Duration::from_secs(2), None)),
        ];

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![target_pool]], test_now(), &cfg);

        assert!(analysis.all_blocks.is_empty());
        assert_eq!(analysis.frags[0].health, FragHealth::Repairing);
        assert_eq!(analysis.blocks_to_allocate.len(), 3);

        let sources: Vec<ObjectId> = analysis
            .blocks_to_allocate
            .iter()
            .map(|r| r.source.id)
            .collect();
        assert_eq!(sources[0], blocks[0].id);
        assert_eq!(sources[1], blocks[1].id);
        assert_eq!(sources[2], blocks[0].id);
    }

    #[test]
    fn test_decommissioning_counts_as_source_not_replica() {
        let cfg = test_config();
        let pool = ObjectId::new();
        let chunk = make_chunk(1);
        let blocks = vec![
            make_block(0, make_node(pool, FRESH, None)),
            make_block(0, make_node(pool, FRESH, Some(ServiceMode::Decommissioning))),
        ];

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![pool]], test_now(), &cfg);
        let frag = &analysis.frags[0];

        assert_eq!(frag.good.len(), 1);
        assert_eq!(frag.decommissioning.len(), 1);
        assert_eq!(frag.accessible.len(), 2);
        assert_eq!(frag.health, FragHealth::Repairing);
        // Two missing replicas, sources alternating between the two
        // accessible blocks.
        assert_eq!(analysis.blocks_to_allocate.len(), 2);
        assert_ne!(
            analysis.blocks_to_allocate[0].source.id,
            analysis.blocks_to_allocate[1].source.id
        );
    }

    #[test]
    fn test_class_partition_covers_all_policy_blocks() {
        let cfg = test_config();
        let pool = ObjectId::new();
        let chunk = make_chunk(2);

        let mut building = make_block(1, make_node(pool, FRESH, None));
        building.building = Some(test_now());
        let blocks = vec![
            make_block(0, make_node(pool, FRESH, None)),
            make_block(0, make_node(pool, Duration::from_secs(10 * 60), None)),
            make_block(0, make_node(pool, Duration::from_secs(5 * 24 * 60 * 60), None)),
            make_block(1, make_node(pool, FRESH, Some(ServiceMode::Decommissioning))),
            building,
        ];

        let analysis = analyze_chunk(&chunk, &blocks, &[vec![pool]], test_now(), &cfg);

        let mut classified = 0;
        for frag in &analysis.frags {
            classified += frag.good.len()
                + frag.short_gone.len()
                + frag.long_gone.len()
                + frag.building.len()
                + frag.long_building.len()
                + frag.decommissioning.len();
            for good in &frag.good {
                assert!(frag.accessible.iter().any(|b| b.id == good.id));
            }
        }
        assert_eq!(classified, analysis.all_blocks.len());
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let cfg = test_config();
        let pool = ObjectId::new();
        let outside = ObjectId::new();
        let chunk = make_chunk(2);
        let blocks = vec![
            make_block(0, make_node(pool, FRESH, None)),
            make_block(0, make_node(pool, Duration::from_secs(10 * 60), None)),
            make_block(1, make_node(outside, FRESH, None)),
            make_block(1, make_node(outside, Duration::from_secs(1), None)),
        ];
        let groups = vec![vec![pool]];

        let first = analyze_chunk(&chunk, &blocks, &groups, test_now(), &cfg);
        let second = analyze_chunk(&chunk, &blocks, &groups, test_now(), &cfg);

        assert_eq!(
            first
                .blocks_to_remove
                .iter()
                .map(|b| b.id)
                .collect::<Vec<_>>(),
            second
                .blocks_to_remove
                .iter()
                .map(|b| b.id)
                .collect::<Vec<_>>()
        );
        assert_eq!(first.blocks_to_allocate.len(), second.blocks_to_allocate.len());
        for (a, b) in first
            .blocks_to_allocate
            .iter()
            .zip(second.blocks_to_allocate.iter())
        {
            assert_eq!(a.frag, b.frag);
            assert_eq!(a.source.id, b.source.id);
        }
    }
}
