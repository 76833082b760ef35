//! ChunkIO Catalog - the in-memory system catalog
//!
//! A consistent, indexed, read-optimized snapshot of the control plane's
//! structural entities (systems, accounts, roles, buckets, tiering policies,
//! tiers, pools), loaded from a durable document store and kept fresh by an
//! age-driven refresh policy plus cluster-wide invalidation.
//!
//! Reads go through the published [`CatalogSnapshot`]; writes go through
//! [`CatalogManager::make_changes`], which validates, pre-checks uniqueness,
//! executes unordered bulks and broadcasts a reload.
//!
//! # Example
//! ```ignore
//! use chunkio_catalog::{CatalogManager, Changes, LocalBus, MemDocStore};
//!
//! let manager = CatalogManager::new(store, bus, CatalogConfig::default());
//! manager.make_changes(Changes::new().with_insert("systems", doc)).await?;
//! let snapshot = manager.refresh().await?;
//! let system = snapshot.lookup("systems_by_name", "prod");
//! ```

pub mod bus;
pub mod collections;
pub mod manager;
pub mod schema;
pub mod snapshot;
pub mod store;

pub use bus::{ClusterBus, LocalBus, ReloadNotification};
pub use collections::{CollectionSpec, IndexDecl, COLLECTIONS};
pub use manager::{CatalogManager, Changes};
pub use schema::{FieldKind, Schema, SchemaRegistry};
pub use snapshot::{CatalogSnapshot, Entity, IndexKey};
pub use store::{BulkOp, BulkOpError, BulkReport, DocStore, MemDocStore};
