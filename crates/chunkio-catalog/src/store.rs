//! Document store interface.
//!
//! The durable store is an external collaborator; the catalog only needs
//! three operations from it. `MemDocStore` is the reference implementation
//! used by tests and embedded deployments; it enforces the declared unique
//! compound indexes so a conflict introduced by a racing writer surfaces at
//! execution time exactly like a server-side unique index would.

use crate::collections::CollectionSpec;
use async_trait::async_trait;
use chunkio_common::{Error, ObjectId, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One operation of an unordered bulk.
#[derive(Clone, Debug)]
pub enum BulkOp {
    /// Insert a full document; `_id` must be present
    Insert(Value),
    /// Apply an operator document (`$set` / `$unset`) to the document with
    /// the given id
    UpdateOne { id: ObjectId, update: Value },
}

/// Failure of a single bulk operation; siblings are unaffected.
#[derive(Clone, Debug)]
pub struct BulkOpError {
    pub index: usize,
    pub message: String,
}

/// Outcome of one unordered bulk execution.
#[derive(Clone, Debug, Default)]
pub struct BulkReport {
    pub inserted: usize,
    pub updated: usize,
    pub errors: Vec<BulkOpError>,
}

impl BulkReport {
    /// Whether every operation of the bulk succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Minimal document-store surface the catalog depends on.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Create the collection and its unique compound indexes if missing.
    /// Index builds run in the background; the call is idempotent.
    async fn init_collection(&self, spec: &CollectionSpec) -> Result<()>;

    /// Fetch every document whose `deleted` is null.
    async fn find_live(&self, collection: &str) -> Result<Vec<Value>>;

    /// Execute an unordered bulk. A per-operation failure is reported in the
    /// result and does not abort sibling operations.
    async fn bulk(&self, collection: &str, ops: Vec<BulkOp>) -> Result<BulkReport>;
}

#[derive(Default)]
struct MemCollection {
    docs: BTreeMap<ObjectId, Value>,
    unique_indexes: Vec<Vec<String>>,
}

impl MemCollection {
    fn is_live(doc: &Value) -> bool {
        matches!(doc.get("deleted"), None | Some(Value::Null))
    }

    /// Values of a compound key, `Null` standing in for absent fields so
    /// `deleted` participates in every key.
    fn key_tuple(doc: &Value, fields: &[String]) -> Vec<Value> {
        fields
            .iter()
            .map(|f| doc.get(f).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Check the unique compound indexes for `doc`, ignoring the document
    /// with `exclude` (the one being updated).
    fn unique_violation(&self, doc: &Value, exclude: Option<ObjectId>) -> Option<String> {
        for fields in &self.unique_indexes {
            let key = Self::key_tuple(doc, fields);
            for (id, other) in &self.docs {
                if Some(*id) == exclude {
                    continue;
                }
                if Self::key_tuple(other, fields) == key {
                    return Some(format!(
                        "unique index ({}) violated by {id}",
                        fields.join(", ")
                    ));
                }
            }
        }
        None
    }
}

/// In-memory document store.
#[derive(Default)]
pub struct MemDocStore {
    collections: RwLock<HashMap<String, MemCollection>>,
}

impl MemDocStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of documents (live and tombstoned) in a collection
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.docs.len())
    }
}

pub(crate) fn doc_id(doc: &Value) -> Result<ObjectId> {
    doc.get("_id")
        .and_then(Value::as_str)
        .and_then(ObjectId::parse)
        .ok_or_else(|| Error::internal("document has no valid _id"))
}

/// Apply an operator document to `doc`. Only `$set` and `$unset` are
/// understood; anything else is an error.
fn apply_update(doc: &mut Value, update: &Value) -> std::result::Result<(), String> {
    let Some(ops) = update.as_object() else {
        return Err("update is not an object".to_string());
    };
    for (op, fields) in ops {
        let Some(fields) = fields.as_object() else {
            return Err(format!("{op}: expected an object of fields"));
        };
        match op.as_str() {
            "$set" => {
                for (field, value) in fields {
                    doc[field] = value.clone();
                }
            }
            "$unset" => {
                if let Some(object) = doc.as_object_mut() {
                    for field in fields.keys() {
                        object.remove(field);
                    }
                }
            }
            other => return Err(format!("unsupported update operator: {other}")),
        }
    }
    Ok(())
}

#[async_trait]
impl DocStore for MemDocStore {
    async fn init_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let mut collections = self.collections.write();
        let collection = collections.entry(spec.name.to_string()).or_default();
        collection.unique_indexes = spec
            .unique_indexes
            .iter()
            .map(|fields| fields.iter().map(ToString::to_string).collect())
            .collect();
        Ok(())
    }

    async fn find_live(&self, collection: &str) -> Result<Vec<Value>> {
        let collections = self.collections.read();
        let docs = collections
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|doc| MemCollection::is_live(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(docs)
    }

    async fn bulk(&self, collection: &str, ops: Vec<BulkOp>) -> Result<BulkReport> {
        let mut collections = self.collections.write();
        let collection = collections.entry(collection.to_string()).or_default();
        let mut report = BulkReport::default();

        for (index, op) in ops.into_iter().enumerate() {
            let outcome = match op {
                BulkOp::Insert(doc) => match doc_id(&doc) {
                    Ok(id) if collection.docs.contains_key(&id) => {
                        Err(format!("duplicate _id: {id}"))
                    }
                    Ok(id) => match collection.unique_violation(&doc, None) {
                        Some(message) => Err(message),
                        None => {
                            collection.docs.insert(id, doc);
                            report.inserted += 1;
                            Ok(())
                        }
                    },
                    Err(err) => Err(err.to_string()),
                },
                BulkOp::UpdateOne { id, update } => match collection.docs.get(&id) {
                    Some(doc) => {
                        let mut updated = doc.clone();
                        match apply_update(&mut updated, &update) {
                            Ok(()) => match collection.unique_violation(&updated, Some(id)) {
                                Some(message) => Err(message),
                                None => {
                                    collection.docs.insert(id, updated);
                                    report.updated += 1;
                                    Ok(())
                                }
                            },
                            Err(message) => Err(message),
                        }
                    }
                    None => Err(format!("no document with _id {id}")),
                },
            };
            if let Err(message) = outcome {
                report.errors.push(BulkOpError { index, message });
            }
        }

        Ok(report)
    }
}
