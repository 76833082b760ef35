//! Error types for ChunkIO
//!
//! This module defines the common error type used by the catalog and
//! placement crates.

use thiserror::Error;

/// Common result type for ChunkIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ChunkIO.
///
/// `Clone` is required because a load in flight is shared between every
/// concurrent caller, and each of them receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Catalog errors
    #[error("validation failed for {collection}: {}", .errors.join("; "))]
    Validation {
        collection: String,
        errors: Vec<String>,
    },

    #[error("conflict on {index}: key {key:?} is already taken")]
    Conflict { index: String, key: String },

    #[error("catalog load failed: {0}")]
    Load(String),

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Collaborator errors
    #[error("cluster bus error: {0}")]
    Bus(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(collection: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Validation {
            collection: collection.into(),
            errors,
        }
    }

    /// Create a conflict error
    pub fn conflict(index: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Conflict {
            index: index.into(),
            key: key.into(),
        }
    }

    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    /// Create a store write error
    pub fn store_write(msg: impl Into<String>) -> Self {
        Self::StoreWrite(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a uniqueness conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error leaves the previously published state intact
    #[must_use]
    pub fn is_contained(&self) -> bool {
        matches!(self, Self::Load(_))
    }
}
