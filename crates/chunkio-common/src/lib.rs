//! ChunkIO Common - shared types for the metadata and placement core
//!
//! This crate defines the identifier newtypes, the common error enum and the
//! configuration structures used by the catalog and placement crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CatalogConfig, PlacementConfig};
pub use error::{Error, Result};
pub use types::{DataPlacement, FragLayer, ObjectId, ServiceMode, TierSpec};
