//! DocumentMirror: local copy of one remote document.
//!
//! ```text
//! Idle ──subscribe──► Loading ──snapshot──► Present(value) ◄─┐
//!  ▲                     │                   │   ▲           │
//!  │ disable             │ error             ▼   │ snapshot  │
//!  └──── (any) ◄─────    └────────────► Error(e) Absent ─────┘
//! ```
//!
//! `Loading` is only re-entered on re-subscription (path change or
//! [`refresh`](DocumentMirror::refresh)), never on a regular snapshot.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::{decode, MirrorOptions, MirrorState};
use crate::error::SyncError;
use crate::feed::{ChangeFeed, DocSnapshot, FeedEvent};
use crate::path::DocPath;
use crate::transport::Transport;

/// Lifecycle of a document mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum DocStatus<T> {
    /// No path, or disabled. Not an error.
    Idle,
    /// Subscribed, nothing delivered yet.
    Loading,
    Present(T),
    /// The document does not exist.
    Absent,
    Error(SyncError),
}

impl<T: Clone> DocStatus<T> {
    fn view(&self) -> MirrorState<Option<T>> {
        match self {
            DocStatus::Idle | DocStatus::Absent => MirrorState::default(),
            DocStatus::Loading => MirrorState {
                data: None,
                loading: true,
                error: None,
            },
            DocStatus::Present(value) => MirrorState {
                data: Some(value.clone()),
                loading: false,
                error: None,
            },
            DocStatus::Error(e) => MirrorState {
                data: None,
                loading: false,
                error: Some(e.clone()),
            },
        }
    }
}

/// Mirror of a single document, decoded into `T`.
pub struct DocumentMirror<T> {
    transport: Arc<dyn Transport>,
    path: Option<DocPath>,
    enabled: bool,
    feed: Option<ChangeFeed<DocSnapshot>>,
    status: DocStatus<T>,
    observers: watch::Sender<MirrorState<Option<T>>>,
    torn_down: bool,
}

impl<T> DocumentMirror<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create the mirror and, when enabled with a path, subscribe right away.
    pub fn new(
        transport: Arc<dyn Transport>,
        path: Option<DocPath>,
        options: MirrorOptions,
    ) -> Self {
        let (observers, _) = watch::channel(MirrorState::default());
        let mut mirror = Self {
            transport,
            path,
            enabled: options.enabled,
            feed: None,
            status: DocStatus::Idle,
            observers,
            torn_down: false,
        };
        mirror.resubscribe();
        mirror
    }

    pub fn path(&self) -> Option<&DocPath> {
        self.path.as_ref()
    }

    pub fn status(&self) -> &DocStatus<T> {
        &self.status
    }

    pub fn data(&self) -> Option<&T> {
        match &self.status {
            DocStatus::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn loading(&self) -> bool {
        matches!(self.status, DocStatus::Loading)
    }

    pub fn error(&self) -> Option<&SyncError> {
        match &self.status {
            DocStatus::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Snapshot of `{data, loading, error}`.
    pub fn state(&self) -> MirrorState<Option<T>> {
        self.status.view()
    }

    /// Observe every state change.
    pub fn watch(&self) -> watch::Receiver<MirrorState<Option<T>>> {
        self.observers.subscribe()
    }

    /// Whether a feed is currently open.
    pub fn is_subscribed(&self) -> bool {
        self.feed.as_ref().is_some_and(ChangeFeed::is_active)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Point the mirror at another document (or none). A different path
    /// tears down the old subscription and opens a new one.
    pub fn set_path(&mut self, path: Option<DocPath>) {
        if self.path == path {
            return;
        }
        self.path = path;
        self.resubscribe();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.resubscribe();
    }

    /// Tear down and re-open the subscription, e.g. after a transient error.
    pub fn refresh(&mut self) {
        self.resubscribe();
    }

    /// Cancel the subscription for good. Idempotent; the current state is
    /// frozen and nothing delivered afterwards is applied.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.feed.as_mut().and_then(ChangeFeed::try_next) {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    /// Wait for the next event and apply it. Returns `false` when there is
    /// no live feed to wait on.
    pub async fn changed(&mut self) -> bool {
        let Some(feed) = self.active_feed() else {
            return false;
        };
        match feed.next().await {
            Some(event) => {
                self.apply(event);
                true
            }
            None => false,
        }
    }

    pub(crate) fn active_feed(&mut self) -> Option<&mut ChangeFeed<DocSnapshot>> {
        self.feed.as_mut().filter(|f| f.is_active())
    }

    /// Put the mirror into a terminal error without a feed.
    pub(crate) fn fail(&mut self, error: SyncError) {
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
        self.set_status(DocStatus::Error(error));
    }

    pub(crate) fn apply(&mut self, event: FeedEvent<DocSnapshot>) {
        if self.torn_down {
            return;
        }
        match event {
            FeedEvent::Snapshot(snap) => match (snap.exists, snap.data) {
                (true, Some(data)) => {
                    let id = self.path.as_ref().map_or("", DocPath::id).to_string();
                    match decode::<T>(&id, data) {
                        Ok(value) => self.set_status(DocStatus::Present(value)),
                        Err(e) => {
                            log::warn!("document {id} failed to decode: {e}");
                            self.set_status(DocStatus::Error(e));
                        }
                    }
                }
                _ => self.set_status(DocStatus::Absent),
            },
            FeedEvent::Error(e) => {
                // Terminal for this handle: release it, keep the error.
                if let Some(mut feed) = self.feed.take() {
                    feed.cancel();
                }
                self.set_status(DocStatus::Error(e));
            }
        }
    }

    fn resubscribe(&mut self) {
        if self.torn_down {
            log::warn!("resubscribe on a torn-down document mirror ignored");
            return;
        }
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
        match (&self.path, self.enabled) {
            (Some(path), true) => {
                log::debug!("document mirror subscribing to {path}");
                self.feed = Some(self.transport.subscribe_doc(path));
                self.set_status(DocStatus::Loading);
            }
            _ => self.set_status(DocStatus::Idle),
        }
    }

    fn set_status(&mut self, status: DocStatus<T>) {
        self.status = status;
        self.observers.send_replace(self.status.view());
    }
}

impl<T> Drop for DocumentMirror<T> {
    fn drop(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBackend;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    struct Lesson {
        title: String,
    }

    fn lesson(title: &str) -> crate::feed::Record {
        json!({ "title": title }).as_object().cloned().unwrap()
    }

    fn path(raw: &str) -> Option<DocPath> {
        Some(DocPath::parse(raw).unwrap())
    }

    #[tokio::test]
    async fn test_loading_then_present() {
        let backend = MemoryBackend::new();
        backend.seed(&DocPath::parse("lessons/l1").unwrap(), lesson("Borrowing"));
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), path("lessons/l1"), MirrorOptions::default());

        assert!(mirror.loading());
        assert_eq!(mirror.pump(), 1);
        assert_eq!(mirror.data(), Some(&Lesson { title: "Borrowing".into() }));
        assert!(!mirror.loading());
        assert!(mirror.error().is_none());
    }

    #[tokio::test]
    async fn test_missing_document_is_absent_not_error() {
        let backend = MemoryBackend::new();
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), path("lessons/none"), MirrorOptions::default());
        mirror.pump();
        assert_eq!(mirror.status(), &DocStatus::Absent);
        assert_eq!(mirror.state(), MirrorState { data: None, loading: false, error: None });
    }

    #[tokio::test]
    async fn test_snapshot_does_not_reenter_loading() {
        let backend = MemoryBackend::new();
        let client = backend.connect();
        let p = DocPath::parse("lessons/l1").unwrap();
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(client.clone(), Some(p.clone()), MirrorOptions::default());
        mirror.pump();

        let mut rx = mirror.watch();
        client.write(&p, lesson("Lifetimes")).await.unwrap();
        mirror.pump();
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert!(!seen.loading);
        assert_eq!(seen.data, Some(Lesson { title: "Lifetimes".into() }));
    }

    #[tokio::test]
    async fn test_disable_resets_to_idle() {
        let backend = MemoryBackend::new();
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), path("lessons/l1"), MirrorOptions::default());
        mirror.set_enabled(false);
        assert_eq!(mirror.status(), &DocStatus::Idle);
        assert!(!mirror.loading());
        assert!(mirror.error().is_none());
        assert_eq!(backend.active_subscriptions(), 0);

        mirror.set_enabled(true);
        assert!(mirror.loading());
        assert_eq!(backend.opened(), 2);
    }

    #[tokio::test]
    async fn test_no_path_is_idle() {
        let backend = MemoryBackend::new();
        let mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), None, MirrorOptions::default());
        assert_eq!(mirror.status(), &DocStatus::Idle);
        assert_eq!(backend.opened(), 0);
    }

    #[tokio::test]
    async fn test_path_change_resubscribes() {
        let backend = MemoryBackend::new();
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), path("lessons/l1"), MirrorOptions::default());
        mirror.set_path(path("lessons/l1"));
        assert_eq!(backend.opened(), 1);
        mirror.set_path(path("lessons/l2"));
        assert_eq!(backend.opened(), 2);
        assert_eq!(backend.closed(), 1);
        assert!(mirror.loading());
    }

    #[tokio::test]
    async fn test_permission_error_then_refresh() {
        let backend = MemoryBackend::new();
        backend.deny("admin");
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), path("admin/x"), MirrorOptions::default());
        mirror.pump();
        assert!(matches!(mirror.error(), Some(SyncError::PermissionDenied(_))));
        assert!(!mirror.is_subscribed());

        mirror.set_path(path("lessons/l1"));
        mirror.pump();
        assert_eq!(mirror.status(), &DocStatus::Absent);
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported() {
        let backend = MemoryBackend::new();
        let p = DocPath::parse("lessons/l1").unwrap();
        backend.seed(&p, json!({"title": 7}).as_object().cloned().unwrap());
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), Some(p), MirrorOptions::default());
        mirror.pump();
        assert!(matches!(mirror.error(), Some(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn test_changed_waits_for_event() {
        let backend = MemoryBackend::new();
        let mut mirror: DocumentMirror<Lesson> =
            DocumentMirror::new(backend.connect(), path("lessons/l1"), MirrorOptions::default());
        assert!(mirror.changed().await);
        assert_eq!(mirror.status(), &DocStatus::Absent);

        mirror.teardown();
        assert!(!mirror.changed().await);
    }
}
