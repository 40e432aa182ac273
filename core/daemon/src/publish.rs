//! Snapshot publication.
//!
//! The store is the only writer. Everyone else sees immutable
//! `Arc<Snapshot>` values: pulled from a [`SnapshotHandle`], or pushed
//! through a [`Publisher`] whenever the store commits a change.

use eocc_protocol::Snapshot;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};

/// Change-notification seam between the store and its observers.
pub trait Publisher: Send + Sync {
    fn publish(&self, snapshot: &Arc<Snapshot>);
}

/// Pull-style accessor for the latest committed snapshot.
#[derive(Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    #[cfg(test)]
    pub fn new(initial: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    pub(crate) fn replace(&self, snapshot: Arc<Snapshot>) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = snapshot;
    }
}

/// Fans each published snapshot out to any number of channel subscribers.
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Default)]
pub struct SubscriberHub {
    subscribers: Mutex<Vec<Sender<Arc<Snapshot>>>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Arc<Snapshot>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Publisher for SubscriberHub {
    fn publish(&self, snapshot: &Arc<Snapshot>) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(Arc::clone(snapshot)).is_ok());
    }
}
