//! Store events broadcast to subscribers.

use tokio::sync::broadcast;

use crate::collection::Collection;

/// Something that happened to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// `initialize()` completed
    Ready,
    /// A document was inserted
    Created {
        /// Collection written
        collection: Collection,
        /// Document id
        id: String,
    },
    /// A document was merged
    Updated {
        /// Collection written
        collection: Collection,
        /// Document id
        id: String,
    },
    /// A document was removed
    Deleted {
        /// Collection written
        collection: Collection,
        /// Document id
        id: String,
    },
    /// `close()` completed
    Closed,
}

#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to current subscribers; no subscribers is fine.
    pub(crate) fn emit(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }
}
