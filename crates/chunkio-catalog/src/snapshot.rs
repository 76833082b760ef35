//! Immutable catalog snapshot.
//!
//! A snapshot is built from the raw per-collection documents in three
//! phases: id arena, reference resolution, secondary indexes. Once built it
//! is published behind an atomic reference and never mutated; readers hold
//! `Arc<Entity>` links into the arena, so an entity reached through a
//! resolved cross-reference is pointer-identical to the one returned by
//! `by_id`.

use crate::collections::{IndexDecl, INDEXES};
use chunkio_common::{DataPlacement, Error, ObjectId, Result, TierSpec};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Walk a dotted path through objects and arrays.
fn value_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// One catalog entity: the raw document plus its resolved reference links.
#[derive(Debug)]
pub struct Entity {
    id: ObjectId,
    collection: String,
    doc: Value,
    links: HashMap<String, ObjectId>,
}

impl Entity {
    /// Entity identifier
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Collection the entity belongs to
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Raw document
    #[must_use]
    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// Value at a dotted path
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&Value> {
        value_at(&self.doc, path)
    }

    /// String value at a dotted path
    #[must_use]
    pub fn str_field(&self, path: &str) -> Option<&str> {
        self.field(path).and_then(Value::as_str)
    }

    /// Resolved reference at a dotted path.
    ///
    /// `None` either because the field is absent or because its identifier
    /// did not resolve at build time; the raw value is still readable via
    /// [`Entity::field`].
    #[must_use]
    pub fn link(&self, path: &str) -> Option<ObjectId> {
        self.links.get(path).copied()
    }

    /// Resolved references of an array field, in array order. Unresolved
    /// elements are skipped.
    #[must_use]
    pub fn link_array(&self, path: &str) -> Vec<ObjectId> {
        match self.field(path) {
            Some(Value::Array(items)) => (0..items.len())
                .filter_map(|i| self.link(&format!("{path}.{i}")))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Record every identifier-valued field that resolves within the arena.
///
/// Detection is by value kind: any string that parses as an identifier is a
/// candidate, except under the field names `_id` and `id`, which name the
/// entity itself. Arrays and nested objects are traversed; other leaves are
/// ignored.
fn collect_links(
    value: &Value,
    prefix: &str,
    known: &HashSet<ObjectId>,
    links: &mut HashMap<String, ObjectId>,
) {
    match value {
        Value::String(s) => {
            if let Some(id) = ObjectId::parse(s) {
                if known.contains(&id) {
                    links.insert(prefix.to_string(), id);
                }
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                if key == "_id" || key == "id" {
                    continue;
                }
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_links(child, &path, known, links);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_links(child, &format!("{prefix}.{i}"), known, links);
            }
        }
        _ => {}
    }
}

#[derive(Clone, Debug)]
enum IndexSlot {
    One(ObjectId),
    Many(Vec<ObjectId>),
}

/// Key a candidate item would occupy in one non-array index; batches reserve
/// these against their own siblings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub index: &'static str,
    pub context: Option<ObjectId>,
    pub key: String,
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Context and key an item occupies in one index; `None` when the item has
/// no key there or its context cannot be determined.
fn index_slot_of(item: &Value, decl: &IndexDecl) -> Option<(Option<ObjectId>, String)> {
    let key = scalar_key(value_at(item, decl.key)?)?;
    let context = match decl.context {
        None => None,
        Some(path) => Some(value_at(item, path)?.as_str().and_then(ObjectId::parse)?),
    };
    Some((context, key))
}

type IndexMap = HashMap<String, HashMap<Option<ObjectId>, HashMap<String, IndexSlot>>>;

/// Read-optimized, immutable view of the whole catalog.
#[derive(Debug)]
pub struct CatalogSnapshot {
    entities: HashMap<ObjectId, Arc<Entity>>,
    collections: HashMap<String, Vec<ObjectId>>,
    indexes: IndexMap,
}

impl CatalogSnapshot {
    /// Build a snapshot from raw per-collection documents.
    ///
    /// An identifier appearing in two documents is a fatal error; a document
    /// without a valid `_id` is skipped with a warning; a duplicate key in a
    /// non-array index keeps the first value and logs the collision.
    pub fn build(data: HashMap<String, Vec<Value>>) -> Result<Self> {
        // Phase 1: id arena.
        let mut raw: HashMap<ObjectId, (String, Value)> = HashMap::new();
        let mut collections: HashMap<String, Vec<ObjectId>> = HashMap::new();
        for (collection, docs) in data {
            let ids = collections.entry(collection.clone()).or_default();
            for doc in docs {
                let Some(id) = doc.get("_id").and_then(Value::as_str).and_then(ObjectId::parse)
                else {
                    warn!(collection = %collection, "skipping document without a valid _id");
                    continue;
                };
                match raw.entry(id) {
                    Entry::Occupied(existing) => {
                        return Err(Error::load(format!(
                            "id {id} appears in both {} and {collection}",
                            existing.get().0
                        )));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert((collection.clone(), doc));
                        ids.push(id);
                    }
                }
            }
        }

        // Phase 2: reference resolution.
        let known: HashSet<ObjectId> = raw.keys().copied().collect();
        let mut entities: HashMap<ObjectId, Arc<Entity>> = HashMap::with_capacity(raw.len());
        for (id, (collection, doc)) in raw {
            let mut links = HashMap::new();
            collect_links(&doc, "", &known, &mut links);
            entities.insert(
                id,
                Arc::new(Entity {
                    id,
                    collection,
                    doc,
                    links,
                }),
            );
        }

        // Phase 3: secondary indexes.
        let mut indexes: IndexMap = HashMap::new();
        for decl in INDEXES {
            for id in collections.get(decl.collection).into_iter().flatten() {
                let entity = &entities[id];
                let Some((context, key)) = index_slot_of(entity.doc(), decl) else {
                    continue;
                };
                let val = match decl.val {
                    None => *id,
                    Some(path) => {
                        let Some(val) = entity.link(path) else { continue };
                        val
                    }
                };
                let bucket = indexes
                    .entry(decl.name.to_string())
                    .or_default()
                    .entry(context)
                    .or_default();
                if decl.val_array {
                    match bucket
                        .entry(key)
                        .or_insert_with(|| IndexSlot::Many(Vec::new()))
                    {
                        IndexSlot::Many(vals) => vals.push(val),
                        IndexSlot::One(_) => {}
                    }
                } else {
                    match bucket.entry(key) {
                        Entry::Vacant(slot) => {
                            slot.insert(IndexSlot::One(val));
                        }
                        Entry::Occupied(slot) => {
                            warn!(
                                index = decl.name,
                                key = %slot.key(),
                                "index collision; keeping the first value"
                            );
                        }
                    }
                }
            }
        }

        Ok(Self {
            entities,
            collections,
            indexes,
        })
    }

    /// Entity by identifier
    #[must_use]
    pub fn by_id(&self, id: &ObjectId) -> Option<&Arc<Entity>> {
        self.entities.get(id)
    }

    /// Entities of one collection, in load order
    #[must_use]
    pub fn items(&self, collection: &str) -> Vec<&Arc<Entity>> {
        self.collections
            .get(collection)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entities.get(id))
            .collect()
    }

    /// Total number of entities in the snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the snapshot holds no entities
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn slot(&self, index: &str, key: &str, context: Option<ObjectId>) -> Option<&IndexSlot> {
        self.indexes.get(index)?.get(&context)?.get(key)
    }

    /// Lookup in a root-level non-array index
    #[must_use]
    pub fn lookup(&self, index: &str, key: &str) -> Option<&Arc<Entity>> {
        self.lookup_in(index, key, None)
    }

    /// Lookup in a non-array index hanging off `context`
    #[must_use]
    pub fn lookup_in(
        &self,
        index: &str,
        key: &str,
        context: Option<ObjectId>,
    ) -> Option<&Arc<Entity>> {
        match self.slot(index, key, context)? {
            IndexSlot::One(id) => self.entities.get(id),
            IndexSlot::Many(_) => None,
        }
    }

    /// Lookup in an array index
    #[must_use]
    pub fn lookup_all(
        &self,
        index: &str,
        key: &str,
        context: Option<ObjectId>,
    ) -> Vec<&Arc<Entity>> {
        match self.slot(index, key, context) {
            Some(IndexSlot::Many(ids)) => ids.iter().filter_map(|id| self.entities.get(id)).collect(),
            Some(IndexSlot::One(id)) => self.entities.get(id).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Replay index assignment for a candidate item.
    ///
    /// Returns the keys the item would occupy so a batch can reserve them
    /// against its own siblings; fails with a conflict when any non-array
    /// index already maps a key to a different id.
    pub fn check_indexes(&self, collection: &str, item: &Value) -> Result<Vec<IndexKey>> {
        let item_id = item
            .get("_id")
            .and_then(Value::as_str)
            .and_then(ObjectId::parse)
            .ok_or_else(|| Error::internal("candidate document has no valid _id"))?;

        let mut keys = Vec::new();
        for decl in INDEXES
            .iter()
            .filter(|d| d.collection == collection && !d.val_array)
        {
            let Some((context, key)) = index_slot_of(item, decl) else {
                continue;
            };
            if let Some(IndexSlot::One(existing)) = self.slot(decl.name, &key, context) {
                if *existing != item_id {
                    return Err(Error::conflict(decl.name, key));
                }
            }
            keys.push(IndexKey {
                index: decl.name,
                context,
                key,
            });
        }
        Ok(keys)
    }

    /// Placement rules of the bucket's effective tier.
    ///
    /// Follows bucket → tiering policy → tier; unresolved references mean
    /// absence. Only the first tier entry is read.
    // TODO: walk the remaining tier entries once multi-tier policies are placed
    #[must_use]
    pub fn tier_spec_for_bucket(&self, bucket: &Entity) -> Option<TierSpec> {
        let policy = self.by_id(&bucket.link("tiering")?)?;
        let tier = self.by_id(&policy.link("tiers.0.tier")?)?;
        let data_placement = match tier.str_field("data_placement")? {
            "MIRROR" => DataPlacement::Mirror,
            "SPREAD" => DataPlacement::Spread,
            _ => return None,
        };
        Some(TierSpec {
            data_placement,
            pools: tier.link_array("pools"),
        })
    }
}
