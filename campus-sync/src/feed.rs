//! ChangeFeed: one subscription's ordered stream of snapshots.
//!
//! ```text
//! Transport ── FeedSender::snapshot() ──► mpsc (unbounded) ──► ChangeFeed::next()
//!                                                                   │
//!                                          cancel(): close + drain ◄┘
//! ```
//!
//! Each feed owns exactly one transport subscription. Delivery is serialized
//! by the channel, so events arrive in the order the transport emitted them.
//! An error ends the feed; cancelling closes the channel, discards anything
//! still queued and runs the transport's unsubscribe exactly once.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::SyncError;

/// Wire record: a JSON object of field → value.
pub type Record = serde_json::Map<String, Value>;

/// Full state of one document at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DocSnapshot {
    pub exists: bool,
    pub data: Option<Record>,
}

impl DocSnapshot {
    pub fn present(data: Record) -> Self {
        Self {
            exists: true,
            data: Some(data),
        }
    }

    pub fn absent() -> Self {
        Self {
            exists: false,
            data: None,
        }
    }
}

/// Full, ordered result set of one query at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySnapshot {
    pub docs: Vec<(String, Record)>,
}

impl QuerySnapshot {
    pub fn new(docs: Vec<(String, Record)>) -> Self {
        Self { docs }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// A single delivery on a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent<T> {
    Snapshot(T),
    Error(SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Active,
    Failed,
    Cancelled,
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Transport-side half of a feed.
pub struct FeedSender<T> {
    tx: mpsc::UnboundedSender<FeedEvent<T>>,
}

impl<T> Clone for FeedSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> FeedSender<T> {
    /// Deliver a snapshot. Returns `false` once the consumer has cancelled.
    pub fn snapshot(&self, snapshot: T) -> bool {
        self.tx.send(FeedEvent::Snapshot(snapshot)).is_ok()
    }

    /// Deliver a terminal error.
    pub fn error(&self, error: SyncError) -> bool {
        self.tx.send(FeedEvent::Error(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer-side subscription handle.
pub struct ChangeFeed<T> {
    label: String,
    rx: mpsc::UnboundedReceiver<FeedEvent<T>>,
    unsubscribe: Option<Unsubscribe>,
    state: FeedState,
}

impl<T> ChangeFeed<T> {
    /// Create a connected sender/feed pair. `unsubscribe` runs once, on cancel
    /// or drop.
    pub fn open(
        label: impl Into<String>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> (FeedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = label.into();
        log::debug!("feed opened: {label}");
        (
            FeedSender { tx },
            Self {
                label,
                rx,
                unsubscribe: Some(Box::new(unsubscribe)),
                state: FeedState::Active,
            },
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == FeedState::Active
    }

    /// Take the next queued event without waiting.
    pub fn try_next(&mut self) -> Option<FeedEvent<T>> {
        if !self.is_active() {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) => Some(self.observe(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.closed_by_transport()),
        }
    }

    /// Wait for the next event. Returns `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<FeedEvent<T>> {
        if !self.is_active() {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(self.observe(event)),
            None => Some(self.closed_by_transport()),
        }
    }

    /// Cancel the subscription. Idempotent, safe after an error.
    pub fn cancel(&mut self) {
        if self.state == FeedState::Cancelled {
            return;
        }
        self.state = FeedState::Cancelled;
        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        log::debug!("feed cancelled: {} ({discarded} queued events discarded)", self.label);
    }

    fn observe(&mut self, event: FeedEvent<T>) -> FeedEvent<T> {
        if let FeedEvent::Error(e) = &event {
            log::warn!("feed {} failed: {e}", self.label);
            self.state = FeedState::Failed;
        }
        event
    }

    fn closed_by_transport(&mut self) -> FeedEvent<T> {
        self.state = FeedState::Failed;
        log::warn!("feed {} closed by transport", self.label);
        FeedEvent::Error(SyncError::Transport(format!("feed {} closed", self.label)))
    }
}

impl<T> Drop for ChangeFeed<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
