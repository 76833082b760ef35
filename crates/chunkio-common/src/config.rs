//! Configuration types for ChunkIO
//!
//! Tunable policy constants for the placement analyzer and the catalog
//! manager. Defaults follow the production values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Placement policy constants used by the chunk analyzer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Target number of good replicas per fragment
    pub optimal_replicas: usize,
    /// Heartbeat age past which a node is considered permanently gone
    pub long_gone_threshold: Duration,
    /// Heartbeat age past which a node is considered temporarily gone
    pub short_gone_threshold: Duration,
    /// Build age past which an unfinished block is considered abandoned
    pub long_build_threshold: Duration,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            optimal_replicas: 3,
            long_gone_threshold: Duration::from_secs(3 * 24 * 60 * 60 + 12 * 60 * 60), // 3.5 days
            short_gone_threshold: Duration::from_secs(5 * 60),                         // 5 min
            long_build_threshold: Duration::from_secs(20 * 60),                        // 20 min
        }
    }
}

/// Catalog manager tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Snapshot age at which a read triggers a background refresh
    pub start_refresh_threshold: Duration,
    /// Snapshot age at which a read must wait for a fresh load
    pub force_refresh_threshold: Duration,
    /// Delay before a background batch of mutations is flushed
    pub coalesce_interval: Duration,
    /// Address of the background coordinator; a bus reconnect originating
    /// here forces a reload
    pub coordinator_addr: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            start_refresh_threshold: Duration::from_secs(10 * 60), // 10 min
            force_refresh_threshold: Duration::from_secs(60 * 60), // 60 min
            coalesce_interval: Duration::from_secs(3),
            coordinator_addr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_placement_config() {
        let config = PlacementConfig::default();
        assert_eq!(config.optimal_replicas, 3);
        assert!(config.short_gone_threshold < config.long_build_threshold);
        assert!(config.long_build_threshold < config.long_gone_threshold);
    }

    #[test]
    fn test_default_catalog_config() {
        let config = CatalogConfig::default();
        assert!(config.start_refresh_threshold < config.force_refresh_threshold);
        assert_eq!(config.coalesce_interval, Duration::from_secs(3));
    }
}
