//! Catalog manager.
//!
//! Owns the published snapshot and its lifecycle: age-driven refresh with a
//! single load in flight, transactional batch writes with uniqueness
//! pre-checks, cluster-wide invalidation, and coalescing of background
//! mutations into one bulk. The manager is process-wide state; construct one
//! per process and clone the handle freely.

use crate::bus::{ClusterBus, ReloadNotification};
use crate::collections::{COLLECTIONS, COLLECTION_SPECS};
use crate::schema::SchemaRegistry;
use crate::snapshot::{CatalogSnapshot, IndexKey};
use crate::store::{doc_id, BulkOp, DocStore};
use chrono::Utc;
use chunkio_common::{CatalogConfig, Error, ObjectId, Result};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<CatalogSnapshot>>>>;

/// A batch of catalog mutations, applied transactionally by
/// [`CatalogManager::make_changes`].
#[derive(Clone, Debug, Default)]
pub struct Changes {
    /// Full documents to insert, per collection
    pub insert: HashMap<String, Vec<Value>>,
    /// Update payloads (literal fields or `$` operator documents, scoped by
    /// `_id`), per collection
    pub update: HashMap<String, Vec<Value>>,
    /// Ids to soft-delete, per collection
    pub remove: HashMap<String, Vec<ObjectId>>,
}

impl Changes {
    /// Create an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document to insert
    #[must_use]
    pub fn with_insert(mut self, collection: impl Into<String>, doc: Value) -> Self {
        self.insert.entry(collection.into()).or_default().push(doc);
        self
    }

    /// Add an update payload
    #[must_use]
    pub fn with_update(mut self, collection: impl Into<String>, payload: Value) -> Self {
        self.update
            .entry(collection.into())
            .or_default()
            .push(payload);
        self
    }

    /// Add an id to soft-delete
    #[must_use]
    pub fn with_remove(mut self, collection: impl Into<String>, id: ObjectId) -> Self {
        self.remove.entry(collection.into()).or_default().push(id);
        self
    }

    /// Whether the batch contains no mutations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insert.values().all(Vec::is_empty)
            && self.update.values().all(Vec::is_empty)
            && self.remove.values().all(Vec::is_empty)
    }

    /// Merge another batch into this one; lists concatenate.
    pub fn merge(&mut self, other: Changes) {
        for (collection, docs) in other.insert {
            self.insert.entry(collection).or_default().extend(docs);
        }
        for (collection, payloads) in other.update {
            self.update.entry(collection).or_default().extend(payloads);
        }
        for (collection, ids) in other.remove {
            self.remove.entry(collection).or_default().extend(ids);
        }
    }
}

enum LoadState {
    Cold,
    Loading {
        prev: Option<(Arc<CatalogSnapshot>, Instant)>,
        load: SharedLoad,
    },
    Warm {
        snapshot: Arc<CatalogSnapshot>,
        loaded_at: Instant,
    },
    Refreshing {
        snapshot: Arc<CatalogSnapshot>,
        loaded_at: Instant,
        load: SharedLoad,
    },
}

enum RefreshPlan {
    Ready(Arc<CatalogSnapshot>),
    Wait(SharedLoad),
}

struct ManagerInner {
    store: Arc<dyn DocStore>,
    bus: Arc<dyn ClusterBus>,
    registry: SchemaRegistry,
    config: CatalogConfig,
    state: Mutex<LoadState>,
    /// Bumped per load; a driver only applies its result while its token is
    /// still the newest, so a discarded in-flight load cannot clobber state.
    epoch: AtomicU64,
    store_initialized: AtomicBool,
    subscribed: AtomicBool,
    pending: Mutex<Option<Changes>>,
    timer_armed: AtomicBool,
}

impl ManagerInner {
    /// Build a fresh snapshot from the store. Construction happens into a
    /// private object; the caller swaps it in atomically.
    async fn build_snapshot(self: Arc<Self>) -> Result<Arc<CatalogSnapshot>> {
        if !self.store_initialized.load(Ordering::Acquire) {
            for spec in COLLECTION_SPECS {
                self.store
                    .init_collection(spec)
                    .await
                    .map_err(|err| Error::load(format!("init {}: {err}", spec.name)))?;
            }
            self.store_initialized.store(true, Ordering::Release);
        }

        let mut data = HashMap::new();
        for collection in COLLECTIONS {
            let docs = self
                .store
                .find_live(collection)
                .await
                .map_err(|err| Error::load(format!("{collection}: {err}")))?;
            for doc in &docs {
                // Read-time validation failures keep the document; newer
                // peers may understand fields this one does not.
                if let Err(err) = self.registry.validate(collection, doc) {
                    warn!(%err, collection = %collection, "document failed read-time validation");
                }
            }
            data.insert((*collection).to_string(), docs);
        }

        let snapshot = Arc::new(CatalogSnapshot::build(data)?);
        info!(entities = snapshot.len(), "catalog snapshot loaded");
        Ok(snapshot)
    }
}

/// Process-wide catalog handle. Cheap to clone.
#[derive(Clone)]
pub struct CatalogManager {
    inner: Arc<ManagerInner>,
}

impl CatalogManager {
    /// Create a manager over the given store and bus.
    #[must_use]
    pub fn new(store: Arc<dyn DocStore>, bus: Arc<dyn ClusterBus>, config: CatalogConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                bus,
                registry: crate::collections::registry(),
                config,
                state: Mutex::new(LoadState::Cold),
                epoch: AtomicU64::new(0),
                store_initialized: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                pending: Mutex::new(None),
                timer_armed: AtomicBool::new(false),
            }),
        }
    }

    /// Peek at the published snapshot without triggering a load. May lag a
    /// just-finished load by one scheduler tick.
    #[must_use]
    pub fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        match &*self.inner.state.lock() {
            LoadState::Warm { snapshot, .. } | LoadState::Refreshing { snapshot, .. } => {
                Some(Arc::clone(snapshot))
            }
            LoadState::Loading {
                prev: Some((snapshot, _)),
                ..
            } => Some(Arc::clone(snapshot)),
            _ => None,
        }
    }

    /// Register for cluster invalidations. Idempotent; runs once per
    /// process.
    fn ensure_subscribed(&self) {
        if self.inner.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = self.inner.bus.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(note) = rx.recv().await {
                if !note.is_catalog_reload() {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                let manager = CatalogManager { inner };
                if let Err(err) = manager.load().await {
                    warn!(%err, "reload after cluster invalidation failed");
                }
            }
        });
    }

    /// Create the shared load future and its driver task. The caller stores
    /// the future into the state under the same lock.
    fn spawn_load(&self) -> SharedLoad {
        let token = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        let load: SharedLoad = inner.build_snapshot().boxed().shared();

        let weak = Arc::downgrade(&self.inner);
        let driven = load.clone();
        tokio::spawn(async move {
            let result = driven.await;
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock();
            if inner.epoch.load(Ordering::SeqCst) != token {
                return; // superseded by a newer load or a reconnect
            }
            match result {
                Ok(snapshot) => {
                    *state = LoadState::Warm {
                        snapshot,
                        loaded_at: Instant::now(),
                    };
                }
                Err(err) => {
                    warn!(%err, "catalog load failed; keeping the previous snapshot");
                    *state = match std::mem::replace(&mut *state, LoadState::Cold) {
                        LoadState::Loading {
                            prev: Some((snapshot, loaded_at)),
                            ..
                        }
                        | LoadState::Refreshing {
                            snapshot,
                            loaded_at,
                            ..
                        } => LoadState::Warm {
                            snapshot,
                            loaded_at,
                        },
                        LoadState::Loading { prev: None, .. } => LoadState::Cold,
                        other => other,
                    };
                }
            }
        });

        load
    }

    /// Return the working snapshot, reloading according to its age.
    ///
    /// Fresh snapshots are returned as-is; past the start threshold a reload
    /// runs in the background while the cached snapshot is served; past the
    /// force threshold callers wait for fresh data. At most one load runs at
    /// a time, and every concurrent caller awaits that same load.
    pub async fn refresh(&self) -> Result<Arc<CatalogSnapshot>> {
        self.ensure_subscribed();
        let plan = {
            let mut state = self.inner.state.lock();
            let (next, plan) = match std::mem::replace(&mut *state, LoadState::Cold) {
                LoadState::Cold => {
                    let load = self.spawn_load();
                    (
                        LoadState::Loading {
                            prev: None,
                            load: load.clone(),
                        },
                        RefreshPlan::Wait(load),
                    )
                }
                LoadState::Loading { prev, load } => {
                    let plan = RefreshPlan::Wait(load.clone());
                    (LoadState::Loading { prev, load }, plan)
                }
                LoadState::Refreshing {
                    snapshot,
                    loaded_at,
                    load,
                } => {
                    let plan = RefreshPlan::Ready(Arc::clone(&snapshot));
                    (
                        LoadState::Refreshing {
                            snapshot,
                            loaded_at,
                            load,
                        },
                        plan,
                    )
                }
                LoadState::Warm {
                    snapshot,
                    loaded_at,
                } => {
                    let age = loaded_at.elapsed();
                    if age < self.inner.config.start_refresh_threshold {
                        let plan = RefreshPlan::Ready(Arc::clone(&snapshot));
                        (
                            LoadState::Warm {
                                snapshot,
                                loaded_at,
                            },
                            plan,
                        )
                    } else if age >= self.inner.config.force_refresh_threshold {
                        let load = self.spawn_load();
                        (
                            LoadState::Loading {
                                prev: Some((snapshot, loaded_at)),
                                load: load.clone(),
                            },
                            RefreshPlan::Wait(load),
                        )
                    } else {
                        let load = self.spawn_load();
                        let plan = RefreshPlan::Ready(Arc::clone(&snapshot));
                        (
                            LoadState::Refreshing {
                                snapshot,
                                loaded_at,
                                load,
                            },
                            plan,
                        )
                    }
                }
            };
            *state = next;
            plan
        };

        match plan {
            RefreshPlan::Ready(snapshot) => Ok(snapshot),
            RefreshPlan::Wait(load) => load.await,
        }
    }

    /// Force a reload, joining a load already in flight. The previous
    /// snapshot stays published until the new one is ready.
    pub async fn load(&self) -> Result<Arc<CatalogSnapshot>> {
        self.ensure_subscribed();
        let wait = {
            let mut state = self.inner.state.lock();
            let (next, wait) = match std::mem::replace(&mut *state, LoadState::Cold) {
                LoadState::Loading { prev, load } => {
                    let wait = load.clone();
                    (LoadState::Loading { prev, load }, wait)
                }
                LoadState::Refreshing {
                    snapshot,
                    loaded_at,
                    load,
                } => {
                    let wait = load.clone();
                    (
                        LoadState::Refreshing {
                            snapshot,
                            loaded_at,
                            load,
                        },
                        wait,
                    )
                }
                LoadState::Cold => {
                    let load = self.spawn_load();
                    (
                        LoadState::Loading {
                            prev: None,
                            load: load.clone(),
                        },
                        load,
                    )
                }
                LoadState::Warm {
                    snapshot,
                    loaded_at,
                } => {
                    let load = self.spawn_load();
                    (
                        LoadState::Loading {
                            prev: Some((snapshot, loaded_at)),
                            load: load.clone(),
                        },
                        load,
                    )
                }
            };
            *state = next;
            wait
        };
        wait.await
    }

    /// Apply a batch of mutations.
    ///
    /// Inserts are schema-validated and uniqueness-prechecked against the
    /// working snapshot (and against each other); any failure aborts the
    /// whole batch before a single write. Per-collection bulks then execute
    /// unordered and in parallel; a per-op failure does not abort its
    /// siblings but does surface as a write error and suppresses the
    /// broadcast. On success every peer is told to reload, this process
    /// included.
    pub async fn make_changes(&self, changes: Changes) -> Result<()> {
        let mut changes = changes;
        let snapshot = self.refresh().await?;

        for (collection, docs) in &mut changes.insert {
            for doc in docs.iter_mut() {
                if doc.is_object() && doc.get("_id").is_none() {
                    doc["_id"] = Value::String(ObjectId::new().to_string());
                }
                self.inner.registry.validate(collection, doc)?;
            }
        }

        // Keys claimed by earlier batch members are reserved against later
        // ones; the snapshot alone cannot see intra-batch collisions.
        let mut reserved: HashMap<IndexKey, ObjectId> = HashMap::new();
        let mut reserve = |keys: Vec<IndexKey>, id: ObjectId| -> Result<()> {
            for key in keys {
                match reserved.entry(key) {
                    Entry::Occupied(entry) => {
                        if *entry.get() != id {
                            return Err(Error::conflict(entry.key().index, entry.key().key.clone()));
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(id);
                    }
                }
            }
            Ok(())
        };

        for (collection, docs) in &changes.insert {
            for doc in docs {
                let id = doc_id(doc)?;
                reserve(snapshot.check_indexes(collection, doc)?, id)?;
            }
        }
        for (collection, payloads) in &changes.update {
            for payload in payloads {
                let id = doc_id(payload)?;
                let candidate = match snapshot.by_id(&id) {
                    Some(entity) => merged_candidate(entity.doc(), payload),
                    None => payload.clone(),
                };
                reserve(snapshot.check_indexes(collection, &candidate)?, id)?;
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut bulks: HashMap<String, Vec<BulkOp>> = HashMap::new();
        for (collection, docs) in changes.insert {
            bulks
                .entry(collection)
                .or_default()
                .extend(docs.into_iter().map(BulkOp::Insert));
        }
        for (collection, payloads) in changes.update {
            let ops = bulks.entry(collection).or_default();
            for payload in payloads {
                let id = doc_id(&payload)?;
                ops.push(BulkOp::UpdateOne {
                    id,
                    update: wrap_update(payload),
                });
            }
        }
        for (collection, ids) in changes.remove {
            let ops = bulks.entry(collection).or_default();
            for id in ids {
                ops.push(BulkOp::UpdateOne {
                    id,
                    update: json!({ "$set": { "deleted": now } }),
                });
            }
        }
        if bulks.is_empty() {
            return Ok(());
        }

        let bulk_futures: Vec<_> = bulks
            .into_iter()
            .map(|(collection, ops)| {
                let store = Arc::clone(&self.inner.store);
                async move {
                    let result = store.bulk(&collection, ops).await;
                    (collection, result)
                }
            })
            .collect();

        let mut failures = Vec::new();
        for (collection, result) in futures::future::join_all(bulk_futures).await {
            match result {
                Ok(report) if report.is_ok() => {
                    debug!(
                        collection = %collection,
                        inserted = report.inserted,
                        updated = report.updated,
                        "bulk applied"
                    );
                }
                Ok(report) => {
                    for err in &report.errors {
                        failures.push(format!("{collection}[{}]: {}", err.index, err.message));
                    }
                }
                Err(err) => failures.push(format!("{collection}: {err}")),
            }
        }
        if !failures.is_empty() {
            return Err(Error::store_write(failures.join("; ")));
        }

        // Best effort: a peer that misses this heals via the refresh policy.
        if let Err(err) = self
            .inner
            .bus
            .publish(ReloadNotification::reload_catalog())
            .await
        {
            warn!(%err, "reload broadcast failed");
        }
        self.load().await?;
        Ok(())
    }

    /// Queue mutations for the next coalesced flush.
    ///
    /// Batches queued within the coalesce interval merge into one
    /// [`CatalogManager::make_changes`] call; a single timer is armed per
    /// process.
    pub fn make_changes_in_background(&self, changes: Changes) {
        {
            let mut pending = self.inner.pending.lock();
            match pending.as_mut() {
                Some(batch) => batch.merge(changes),
                None => *pending = Some(changes),
            }
        }

        if self.inner.timer_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.coalesce_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else { return };
            inner.timer_armed.store(false, Ordering::SeqCst);
            let batch = inner.pending.lock().take();
            if let Some(batch) = batch {
                let manager = CatalogManager { inner };
                if let Err(err) = manager.make_changes(batch).await {
                    warn!(%err, "background batch flush failed");
                }
            }
        });
    }

    /// The document store reconnected: init must run again and the catalog
    /// reloads. A load in flight is discarded so the fresh one can start.
    pub async fn handle_store_reconnect(&self) -> Result<Arc<CatalogSnapshot>> {
        self.inner.store_initialized.store(false, Ordering::Release);
        {
            let mut state = self.inner.state.lock();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            *state = match std::mem::replace(&mut *state, LoadState::Cold) {
                LoadState::Loading {
                    prev: Some((snapshot, loaded_at)),
                    ..
                }
                | LoadState::Refreshing {
                    snapshot,
                    loaded_at,
                    ..
                } => LoadState::Warm {
                    snapshot,
                    loaded_at,
                },
                LoadState::Loading { prev: None, .. } => LoadState::Cold,
                other => other,
            };
        }
        self.load().await
    }

    /// The cluster bus reconnected. A reconnect originating from the
    /// background coordinator means missed invalidations: reload.
    pub async fn handle_bus_reconnect(&self, origin: &str) -> Result<()> {
        if self.inner.config.coordinator_addr.as_deref() == Some(origin) {
            self.load().await?;
        }
        Ok(())
    }
}

/// Overlay an update payload onto the current document so uniqueness
/// pre-checks see the document as it would be after the update.
fn merged_candidate(current: &Value, payload: &Value) -> Value {
    let mut merged = current.clone();
    let fields = match payload.as_object().and_then(|o| o.keys().next()) {
        Some(first) if first.starts_with('$') => payload
            .get("$set")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        _ => payload.as_object().cloned().unwrap_or_default(),
    };
    for (field, value) in fields {
        if field != "_id" {
            merged[field.as_str()] = value;
        }
    }
    merged
}

/// A payload whose first key does not start with `$` is a literal field set;
/// wrap it as a `$set` (with the immutable `_id` stripped).
fn wrap_update(payload: Value) -> Value {
    let is_operator = payload
        .as_object()
        .and_then(|o| o.keys().next())
        .is_some_and(|k| k.starts_with('$'));
    if is_operator {
        payload
    } else {
        let mut fields = payload.as_object().cloned().unwrap_or_default();
        fields.remove("_id");
        json!({ "$set": Value::Object(fields) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::collections::{ACCOUNTS, BUCKETS, POOLS, ROLES, SYSTEMS, TIERING_POLICIES, TIERS};
    use crate::store::MemDocStore;
    use std::time::Duration;

    fn setup() -> (CatalogManager, Arc<MemDocStore>, Arc<LocalBus>) {
        setup_with(CatalogConfig::default())
    }

    fn setup_with(config: CatalogConfig) -> (CatalogManager, Arc<MemDocStore>, Arc<LocalBus>) {
        let store = Arc::new(MemDocStore::new());
        let bus = Arc::new(LocalBus::new());
        let manager = CatalogManager::new(store.clone(), bus.clone(), config);
        (manager, store, bus)
    }

    fn system_doc(id: ObjectId, name: &str) -> Value {
        json!({ "_id": id.to_string(), "name": name })
    }

    fn bucket_doc(id: ObjectId, system: ObjectId, name: &str) -> Value {
        json!({
            "_id": id.to_string(),
            "system": system.to_string(),
            "name": name,
        })
    }

    async fn settle(manager: &CatalogManager, expected: usize) {
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if manager.current().is_some_and(|s| s.len() == expected) {
                return;
            }
        }
        panic!("snapshot never settled at {expected} entities");
    }

    #[tokio::test]
    async fn test_cold_load_builds_snapshot_from_store() {
        let (manager, store, _bus) = setup();
        let system = ObjectId::new();
        store
            .bulk(SYSTEMS, vec![BulkOp::Insert(system_doc(system, "prod"))])
            .await
            .unwrap();

        let snapshot = manager.refresh().await.unwrap();
        assert_eq!(snapshot.by_id(&system).unwrap().str_field("name"), Some("prod"));
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_served_from_cache() {
        let (manager, store, _bus) = setup();
        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "prod"))],
            )
            .await
            .unwrap();

        let first = manager.refresh().await.unwrap();
        let second = manager.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_snapshot_refreshes_in_background() {
        let (manager, store, _bus) = setup();
        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "prod"))],
            )
            .await
            .unwrap();

        let first = manager.refresh().await.unwrap();
        settle(&manager, 1).await;

        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "staging"))],
            )
            .await
            .unwrap();

        // Between the thresholds the cached snapshot is served immediately.
        tokio::time::sleep(Duration::from_secs(15 * 60)).await;
        let served = manager.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&first, &served));

        // The background load lands shortly after.
        settle(&manager, 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_snapshot_forces_a_fresh_load() {
        let (manager, store, _bus) = setup();
        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "prod"))],
            )
            .await
            .unwrap();
        manager.refresh().await.unwrap();
        settle(&manager, 1).await;

        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "staging"))],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        let snapshot = manager.refresh().await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_make_changes_inserts_and_broadcasts() {
        let (manager, store, bus) = setup();
        let system = ObjectId::new();
        let bucket = ObjectId::new();
        let changes = Changes::new()
            .with_insert(SYSTEMS, system_doc(system, "prod"))
            .with_insert(BUCKETS, bucket_doc(bucket, system, "first.bucket"));

        manager.make_changes(changes).await.unwrap();

        assert_eq!(store.count(SYSTEMS), 1);
        assert_eq!(store.count(BUCKETS), 1);
        assert_eq!(bus.published_count(), 1);

        let snapshot = manager.refresh().await.unwrap();
        let found = snapshot
            .lookup_in("buckets_by_name", "first.bucket", Some(system))
            .unwrap();
        assert_eq!(found.id(), bucket);
    }

    #[tokio::test]
    async fn test_duplicate_insert_in_one_batch_aborts_everything() {
        let (manager, store, bus) = setup();
        let system = ObjectId::new();
        let changes = Changes::new()
            .with_insert(BUCKETS, bucket_doc(ObjectId::new(), system, "same"))
            .with_insert(BUCKETS, bucket_doc(ObjectId::new(), system, "same"));

        let err = manager.make_changes(changes).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.count(BUCKETS), 0);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn test_update_into_taken_name_conflicts() {
        let (manager, _store, _bus) = setup();
        let system = ObjectId::new();
        let a = ObjectId::new();
        let b = ObjectId::new();
        manager
            .make_changes(
                Changes::new()
                    .with_insert(BUCKETS, bucket_doc(a, system, "a"))
                    .with_insert(BUCKETS, bucket_doc(b, system, "b")),
            )
            .await
            .unwrap();

        let err = manager
            .make_changes(Changes::new().with_update(
                BUCKETS,
                json!({ "_id": b.to_string(), "name": "a" }),
            ))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_literal_update_is_wrapped_as_set() {
        let (manager, store, _bus) = setup();
        let system = ObjectId::new();
        let bucket = ObjectId::new();
        manager
            .make_changes(
                Changes::new()
                    .with_insert(SYSTEMS, system_doc(system, "prod"))
                    .with_insert(BUCKETS, bucket_doc(bucket, system, "before")),
            )
            .await
            .unwrap();

        manager
            .make_changes(Changes::new().with_update(
                BUCKETS,
                json!({ "_id": bucket.to_string(), "name": "after" }),
            ))
            .await
            .unwrap();

        // $set semantics: untouched fields survive the update.
        let docs = store.find_live(BUCKETS).await.unwrap();
        assert_eq!(docs[0]["name"], "after");
        assert_eq!(docs[0]["system"], system.to_string());
    }

    #[tokio::test]
    async fn test_remove_soft_deletes() {
        let (manager, store, _bus) = setup();
        let system = ObjectId::new();
        manager
            .make_changes(Changes::new().with_insert(SYSTEMS, system_doc(system, "prod")))
            .await
            .unwrap();

        manager
            .make_changes(Changes::new().with_remove(SYSTEMS, system))
            .await
            .unwrap();

        // The tombstone stays in the store but leaves the snapshot.
        assert_eq!(store.count(SYSTEMS), 1);
        assert!(store.find_live(SYSTEMS).await.unwrap().is_empty());
        let snapshot = manager.refresh().await.unwrap();
        assert!(snapshot.by_id(&system).is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_aborts_batch() {
        let (manager, store, bus) = setup();
        let changes = Changes::new().with_insert(
            BUCKETS,
            json!({ "name": "no-system-reference" }),
        );

        let err = manager.make_changes(changes).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.count(BUCKETS), 0);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_changes_coalesce_into_one_bulk() {
        let (manager, store, bus) = setup();
        // Prime the snapshot so the flush path is warm.
        manager.refresh().await.unwrap();

        manager.make_changes_in_background(
            Changes::new().with_insert(SYSTEMS, system_doc(ObjectId::new(), "one")),
        );
        manager.make_changes_in_background(
            Changes::new().with_insert(SYSTEMS, system_doc(ObjectId::new(), "two")),
        );

        // Nothing flushes before the timer fires.
        assert_eq!(store.count(SYSTEMS), 0);
        assert_eq!(bus.published_count(), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if bus.published_count() > 0 {
                break;
            }
        }

        assert_eq!(store.count(SYSTEMS), 2);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_yields_isomorphic_snapshot() {
        let (manager, store, _bus) = setup();
        let system = ObjectId::new();
        let account = ObjectId::new();
        let pool = ObjectId::new();
        let tier = ObjectId::new();
        let policy = ObjectId::new();
        let bucket = ObjectId::new();
        manager
            .make_changes(
                Changes::new()
                    .with_insert(SYSTEMS, system_doc(system, "prod"))
                    .with_insert(
                        ACCOUNTS,
                        json!({ "_id": account.to_string(), "email": "op@example.com" }),
                    )
                    .with_insert(
                        ROLES,
                        json!({
                            "_id": ObjectId::new().to_string(),
                            "account": account.to_string(),
                            "system": system.to_string(),
                            "role": "admin",
                        }),
                    )
                    .with_insert(
                        POOLS,
                        json!({
                            "_id": pool.to_string(),
                            "system": system.to_string(),
                            "name": "pool-a",
                            "nodes": [],
                        }),
                    )
                    .with_insert(
                        TIERS,
                        json!({
                            "_id": tier.to_string(),
                            "system": system.to_string(),
                            "name": "standard",
                            "data_placement": "SPREAD",
                            "pools": [pool.to_string()],
                        }),
                    )
                    .with_insert(
                        TIERING_POLICIES,
                        json!({
                            "_id": policy.to_string(),
                            "system": system.to_string(),
                            "name": "default",
                            "tiers": [{ "order": 0, "tier": tier.to_string() }],
                        }),
                    )
                    .with_insert(BUCKETS, bucket_doc(bucket, system, "first.bucket")),
            )
            .await
            .unwrap();
        let written = manager.refresh().await.unwrap();

        // A second manager over the same store reconstructs the same world.
        let bus2 = Arc::new(LocalBus::new());
        let manager2 = CatalogManager::new(store, bus2, CatalogConfig::default());
        let reloaded = manager2.refresh().await.unwrap();

        assert_eq!(written.len(), reloaded.len());
        for collection in COLLECTIONS {
            let mut a: Vec<ObjectId> = written.items(collection).iter().map(|e| e.id()).collect();
            let mut b: Vec<ObjectId> = reloaded.items(collection).iter().map(|e| e.id()).collect();
            a.sort();
            b.sort();
            assert_eq!(a, b, "{collection} membership differs");
        }
        let reloaded_bucket = reloaded.by_id(&bucket).unwrap();
        assert_eq!(reloaded_bucket.link("tiering"), Some(policy));
        assert_eq!(
            reloaded
                .lookup_in("buckets_by_name", "first.bucket", Some(system))
                .unwrap()
                .id(),
            bucket
        );
        let spec = reloaded.tier_spec_for_bucket(reloaded_bucket).unwrap();
        assert_eq!(spec.pools, vec![pool]);
    }

    #[tokio::test]
    async fn test_peer_invalidation_triggers_reload() {
        let store = Arc::new(MemDocStore::new());
        let bus = Arc::new(LocalBus::new());
        let writer = CatalogManager::new(store.clone(), bus.clone(), CatalogConfig::default());
        let reader = CatalogManager::new(store, bus, CatalogConfig::default());
        reader.refresh().await.unwrap();

        writer
            .make_changes(
                Changes::new().with_insert(SYSTEMS, system_doc(ObjectId::new(), "prod")),
            )
            .await
            .unwrap();

        settle(&reader, 1).await;
    }

    #[tokio::test]
    async fn test_store_reconnect_reinitializes_and_reloads() {
        let (manager, store, _bus) = setup();
        manager
            .make_changes(
                Changes::new().with_insert(SYSTEMS, system_doc(ObjectId::new(), "prod")),
            )
            .await
            .unwrap();

        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "staging"))],
            )
            .await
            .unwrap();

        let snapshot = manager.handle_store_reconnect().await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_bus_reconnect_reloads_only_from_coordinator() {
        let config = CatalogConfig {
            coordinator_addr: Some("coordinator:5672".to_string()),
            ..CatalogConfig::default()
        };
        let (manager, store, _bus) = setup_with(config);
        store
            .bulk(
                SYSTEMS,
                vec![BulkOp::Insert(system_doc(ObjectId::new(), "prod"))],
            )
            .await
            .unwrap();

        manager.handle_bus_reconnect("some-agent:1234").await.unwrap();
        assert!(manager.current().is_none());

        manager.handle_bus_reconnect("coordinator:5672").await.unwrap();
        settle(&manager, 1).await;
    }
}
