//! [`HealthBoard`] – the single synchronized publish point for the
//! localizer's [`HealthSnapshot`].
//!
//! Writers (the scan cycle, the map loader, operator pose resets) update the
//! snapshot through one `watch` channel; readers (diagnostics, the node
//! handle) always observe a complete, consistent copy.

use std::sync::Arc;

use scanloc_types::HealthSnapshot;
use tokio::sync::watch;

/// Cloneable writer side.  All clones share one snapshot.
#[derive(Clone, Debug)]
pub struct HealthBoard {
    tx: Arc<watch::Sender<HealthSnapshot>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HealthSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the whole snapshot.
    pub fn publish(&self, snapshot: HealthSnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// Update the snapshot in place and return the value that was published.
    ///
    /// Read-modify-write happens under the channel's lock, so concurrent
    /// writers never lose each other's updates.
    pub fn modify<F>(&self, f: F) -> HealthSnapshot
    where
        F: FnOnce(&mut HealthSnapshot),
    {
        let mut published = HealthSnapshot::default();
        self.tx.send_modify(|snapshot| {
            f(snapshot);
            published = *snapshot;
        });
        published
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> HealthReader {
        HealthReader { rx: self.tx.subscribe() }
    }
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a [`HealthBoard`].
#[derive(Clone, Debug)]
pub struct HealthReader {
    rx: watch::Receiver<HealthSnapshot>,
}

impl HealthReader {
    pub fn snapshot(&self) -> HealthSnapshot {
        *self.rx.borrow()
    }

    /// Wait until a writer publishes a new snapshot.
    ///
    /// Returns `false` once every [`HealthBoard`] clone has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
