//! Pool grouping rules derived from a tier's placement mode.

use chunkio_common::{DataPlacement, ObjectId, TierSpec};
use std::collections::HashSet;

/// Expand a tier into pool groups.
///
/// `MIRROR` produces one group per pool (every group must hold a full copy);
/// `SPREAD` produces a single combined group (the pools act as one).
#[must_use]
pub fn pools_groups(tier: &TierSpec) -> Vec<Vec<ObjectId>> {
    match tier.data_placement {
        DataPlacement::Mirror => tier.pools.iter().map(|pool| vec![*pool]).collect(),
        DataPlacement::Spread => vec![tier.pools.clone()],
    }
}

/// Union all groups into the single target pool set.
///
/// The current analysis flattens the groups; per-group mirror analysis is the
/// intended extension point and keeps the grouped shape in the analyzer
/// signature.
#[must_use]
pub fn flatten_groups(groups: &[Vec<ObjectId>]) -> HashSet<ObjectId> {
    groups.iter().flatten().copied().collect()
}
