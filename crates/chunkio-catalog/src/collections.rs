//! Catalog collection declarations.
//!
//! One place for everything the catalog knows per collection: document
//! schema, the unique compound indexes the store must maintain, and the
//! secondary indexes the snapshot builds.

use crate::schema::{FieldKind, Schema, SchemaRegistry};

/// Catalog collection names
pub const SYSTEMS: &str = "systems";
pub const ACCOUNTS: &str = "accounts";
pub const ROLES: &str = "roles";
pub const BUCKETS: &str = "buckets";
pub const TIERING_POLICIES: &str = "tiering_policies";
pub const TIERS: &str = "tiers";
pub const POOLS: &str = "pools";

/// All catalog collections, in load order.
pub const COLLECTIONS: &[&str] = &[
    SYSTEMS,
    ACCOUNTS,
    ROLES,
    BUCKETS,
    TIERING_POLICIES,
    TIERS,
    POOLS,
];

/// Store-level declaration for one collection: its name and the unique
/// compound indexes created at init (with background builds).
///
/// `deleted` participates in every key so tombstones never collide with new
/// inserts.
#[derive(Clone, Copy, Debug)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub unique_indexes: &'static [&'static [&'static str]],
}

/// Unique compound indexes per collection.
pub const COLLECTION_SPECS: &[CollectionSpec] = &[
    CollectionSpec {
        name: SYSTEMS,
        unique_indexes: &[&["name", "deleted"]],
    },
    CollectionSpec {
        name: ACCOUNTS,
        unique_indexes: &[&["email", "deleted"]],
    },
    CollectionSpec {
        name: ROLES,
        unique_indexes: &[&["account", "system", "role", "deleted"]],
    },
    CollectionSpec {
        name: BUCKETS,
        unique_indexes: &[&["system", "name", "deleted"]],
    },
    CollectionSpec {
        name: TIERING_POLICIES,
        unique_indexes: &[&["system", "name", "deleted"]],
    },
    CollectionSpec {
        name: TIERS,
        unique_indexes: &[&["system", "name", "deleted"]],
    },
    CollectionSpec {
        name: POOLS,
        unique_indexes: &[&["system", "name", "deleted"]],
    },
];

/// Declaration of one snapshot secondary index.
///
/// `key` and `val` are dotted paths into the item; `context` is a dotted
/// path whose resolved entity the index hangs off (the snapshot root when
/// absent). Non-array indexes are the uniqueness pre-check surface.
#[derive(Clone, Copy, Debug)]
pub struct IndexDecl {
    pub name: &'static str,
    pub collection: &'static str,
    pub context: Option<&'static str>,
    pub key: &'static str,
    pub val: Option<&'static str>,
    pub val_array: bool,
}

/// Snapshot secondary indexes.
pub const INDEXES: &[IndexDecl] = &[
    IndexDecl {
        name: "systems_by_name",
        collection: SYSTEMS,
        context: None,
        key: "name",
        val: None,
        val_array: false,
    },
    IndexDecl {
        name: "accounts_by_email",
        collection: ACCOUNTS,
        context: None,
        key: "email",
        val: None,
        val_array: false,
    },
    IndexDecl {
        name: "buckets_by_name",
        collection: BUCKETS,
        context: Some("system"),
        key: "name",
        val: None,
        val_array: false,
    },
    IndexDecl {
        name: "tiering_policies_by_name",
        collection: TIERING_POLICIES,
        context: Some("system"),
        key: "name",
        val: None,
        val_array: false,
    },
    IndexDecl {
        name: "tiers_by_name",
        collection: TIERS,
        context: Some("system"),
        key: "name",
        val: None,
        val_array: false,
    },
    IndexDecl {
        name: "pools_by_name",
        collection: POOLS,
        context: Some("system"),
        key: "name",
        val: None,
        val_array: false,
    },
    IndexDecl {
        name: "roles_by_system",
        collection: ROLES,
        context: Some("account"),
        key: "system",
        val: None,
        val_array: true,
    },
];

/// Build the schema registry for all catalog collections.
#[must_use]
pub fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();

    registry.register(
        SYSTEMS,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("name", FieldKind::String)
            .optional("deleted", FieldKind::Timestamp),
    );

    registry.register(
        ACCOUNTS,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("email", FieldKind::String)
            .optional("password_hash", FieldKind::String)
            .optional("deleted", FieldKind::Timestamp),
    );

    registry.register(
        ROLES,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("account", FieldKind::ObjectId)
            .field("system", FieldKind::ObjectId)
            .field("role", FieldKind::Enum(&["admin", "operator", "viewer"]))
            .optional("deleted", FieldKind::Timestamp),
    );

    registry.register(
        BUCKETS,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("system", FieldKind::ObjectId)
            .field("name", FieldKind::String)
            .optional("tiering", FieldKind::ObjectId)
            .optional("deleted", FieldKind::Timestamp),
    );

    registry.register(
        TIERING_POLICIES,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("system", FieldKind::ObjectId)
            .field("name", FieldKind::String)
            .field(
                "tiers",
                FieldKind::Array(Box::new(FieldKind::Object(
                    Schema::new()
                        .field("order", FieldKind::Integer)
                        .field("tier", FieldKind::ObjectId),
                ))),
            )
            .optional("deleted", FieldKind::Timestamp),
    );

    registry.register(
        TIERS,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("system", FieldKind::ObjectId)
            .field("name", FieldKind::String)
            .field("data_placement", FieldKind::Enum(&["MIRROR", "SPREAD"]))
            .field("pools", FieldKind::Array(Box::new(FieldKind::ObjectId)))
            .optional("deleted", FieldKind::Timestamp),
    );

    registry.register(
        POOLS,
        Schema::new()
            .field("_id", FieldKind::ObjectId)
            .field("system", FieldKind::ObjectId)
            .field("name", FieldKind::String)
            .field("nodes", FieldKind::Array(Box::new(FieldKind::ObjectId)))
            .optional("deleted", FieldKind::Timestamp),
    );

    registry
}
