//! Progress listener registry
//!
//! Batch runs report [`ProgressInfo`] snapshots to every registered listener.
//! Listeners are plain callbacks invoked synchronously, in registration order,
//! on the task driving the run, so they observe `processed` counts in
//! non-decreasing order. Callers that prefer a queue can use
//! [`ProgressRegistry::subscribe_channel`], which forwards snapshots into a
//! bounded tokio channel and drops snapshots when the receiver falls behind.

use crate::types::ProgressInfo;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle returned by [`ProgressRegistry::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Progress callback
pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Registered progress listeners
#[derive(Default)]
pub struct ProgressRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, ProgressCallback)>>,
}

impl fmt::Debug for ProgressRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressRegistry")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl ProgressRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(callback)));
        id
    }

    /// Unregister a listener; returns whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Forward snapshots into a bounded channel
    ///
    /// Snapshots are dropped while the channel is full. The listener stays
    /// registered until [`off`](Self::off) is called with the returned id.
    pub fn subscribe_channel(&self, capacity: usize) -> (ListenerId, mpsc::Receiver<ProgressInfo>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.on(move |info| {
            let _ = tx.try_send(info.clone());
        });
        (id, rx)
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `info` to every listener
    ///
    /// Callbacks run outside the registry lock, so a listener may register or
    /// unregister listeners without deadlocking.
    pub fn emit(&self, info: &ProgressInfo) {
        let listeners: Vec<ProgressCallback> =
            self.listeners.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in listeners {
            callback(info);
        }
    }
}
