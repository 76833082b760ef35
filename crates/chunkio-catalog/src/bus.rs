//! Cluster invalidation bus.
//!
//! Mutation commits broadcast a reload notification to every peer, including
//! the publisher. Delivery is best effort: a missed notification is healed by
//! the age-based refresh policy. `LocalBus` is the loopback implementation
//! for single-process deployments and tests.

use async_trait::async_trait;
use chunkio_common::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Wire form of a catalog invalidation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadNotification {
    pub method_api: String,
    pub method_name: String,
    /// Empty target addresses every peer
    pub target: String,
}

impl ReloadNotification {
    /// Method name carried by catalog invalidations
    pub const METHOD_NAME: &'static str = "load_system_store";

    /// Notification telling every peer to reload the catalog
    #[must_use]
    pub fn reload_catalog() -> Self {
        Self {
            method_api: "cluster_api".to_string(),
            method_name: Self::METHOD_NAME.to_string(),
            target: String::new(),
        }
    }

    /// Whether this notification asks for a catalog reload
    #[must_use]
    pub fn is_catalog_reload(&self) -> bool {
        self.method_name == Self::METHOD_NAME
    }
}

/// Broadcast channel between control-plane peers.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Publish to all peers, including the publisher.
    async fn publish(&self, note: ReloadNotification) -> Result<()>;

    /// Receive every notification published after this call.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ReloadNotification>;
}

/// Loopback bus delivering to in-process subscribers.
#[derive(Default)]
pub struct LocalBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ReloadNotification>>>,
    published: AtomicUsize,
}

impl LocalBus {
    /// Create a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications published so far
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClusterBus for LocalBus {
    async fn publish(&self, note: ReloadNotification) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .retain(|sender| sender.send(note.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ReloadNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
