//! FanOutMirror: one document subscription per tracked identifier.
//!
//! Used when the identifier set itself changes over time (a roster of chat
//! participants, a learner's pinned courses):
//!
//! ```text
//! set_ids([A, B, C])
//!      │
//!      ├── A ── DocumentMirror ──┐
//!      ├── B ── DocumentMirror ──┼──► merged Vec<Entry<T>> (insertion order)
//!      └── C ── DocumentMirror ──┘
//! ```
//!
//! Children are exclusively owned: removing an identifier cancels its
//! subscription in the same call, re-adding it opens a fresh one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::select_all;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::{DocStatus, DocumentMirror, Entry, MirrorOptions, MirrorState};
use crate::path::CollectionPath;
use crate::transport::Transport;

/// Identifiers opened and closed by one [`FanOutMirror::set_ids`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl FanOutChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Merged mirror over a dynamic set of documents in one collection.
pub struct FanOutMirror<T> {
    transport: Arc<dyn Transport>,
    collection: CollectionPath,
    enabled: bool,
    /// Tracked identifiers, in insertion order.
    order: Vec<String>,
    children: HashMap<String, DocumentMirror<T>>,
    observers: watch::Sender<MirrorState<Vec<Entry<T>>>>,
    torn_down: bool,
}

impl<T> FanOutMirror<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new<I, S>(
        transport: Arc<dyn Transport>,
        collection: CollectionPath,
        ids: I,
        options: MirrorOptions,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (observers, _) = watch::channel(MirrorState::default());
        let mut mirror = Self {
            transport,
            collection,
            enabled: options.enabled,
            order: Vec::new(),
            children: HashMap::new(),
            observers,
            torn_down: false,
        };
        mirror.set_ids(ids);
        mirror
    }

    /// Tracked identifiers in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Open child subscriptions.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Replace the tracked set. Removed identifiers are cancelled before this
    /// returns; new ones are appended after the survivors.
    pub fn set_ids<I, S>(&mut self, ids: I) -> FanOutChange
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.torn_down {
            log::warn!("set_ids on a torn-down fan-out mirror ignored");
            return FanOutChange::default();
        }
        let mut wanted = Vec::new();
        let mut wanted_set = HashSet::new();
        for id in ids {
            let id = id.into();
            if wanted_set.insert(id.clone()) {
                wanted.push(id);
            }
        }

        let mut change = FanOutChange::default();
        let mut kept = Vec::with_capacity(wanted.len());
        for id in std::mem::take(&mut self.order) {
            if wanted_set.contains(&id) {
                kept.push(id);
            } else {
                self.close_child(&id);
                change.removed.push(id);
            }
        }
        self.order = kept;

        for id in wanted {
            if !self.order.contains(&id) {
                if self.enabled {
                    self.open_child(&id);
                }
                self.order.push(id.clone());
                change.added.push(id);
            }
        }

        if !change.is_empty() {
            log::debug!(
                "fan-out over {}: +{} -{}",
                self.collection,
                change.added.len(),
                change.removed.len()
            );
        }
        self.publish();
        change
    }

    /// Start tracking one identifier.
    pub fn track(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.order.contains(&id) {
            return false;
        }
        let mut ids = self.order.clone();
        ids.push(id);
        !self.set_ids(ids).added.is_empty()
    }

    /// Stop tracking one identifier.
    pub fn untrack(&mut self, id: &str) -> bool {
        let ids: Vec<String> = self.order.iter().filter(|i| *i != id).cloned().collect();
        !self.set_ids(ids).removed.is_empty()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled || self.torn_down {
            return;
        }
        self.enabled = enabled;
        if enabled {
            for id in self.order.clone() {
                self.open_child(&id);
            }
        } else {
            for id in self.order.clone() {
                self.close_child(&id);
            }
        }
        self.publish();
    }

    /// Cancel every child subscription. Idempotent; the merged state is
    /// frozen as it was.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for child in self.children.values_mut() {
            child.teardown();
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Merged view: present children in insertion order, loading while any
    /// child has not delivered yet, first child error alongside partial data.
    pub fn state(&self) -> MirrorState<Vec<Entry<T>>> {
        let mut state: MirrorState<Vec<Entry<T>>> = MirrorState::default();
        for id in &self.order {
            let Some(child) = self.children.get(id) else {
                continue;
            };
            match child.status() {
                DocStatus::Present(value) => state.data.push(Entry {
                    id: id.clone(),
                    value: value.clone(),
                }),
                DocStatus::Loading => state.loading = true,
                DocStatus::Error(e) if state.error.is_none() => state.error = Some(e.clone()),
                _ => {}
            }
        }
        state
    }

    pub fn watch(&self) -> watch::Receiver<MirrorState<Vec<Entry<T>>>> {
        self.observers.subscribe()
    }

    /// Status of one child, if tracked and open.
    pub fn child_status(&self, id: &str) -> Option<&DocStatus<T>> {
        self.children.get(id).map(DocumentMirror::status)
    }

    pub fn pump(&mut self) -> usize {
        if self.torn_down {
            return 0;
        }
        let applied: usize = self.children.values_mut().map(DocumentMirror::pump).sum();
        if applied > 0 {
            self.publish();
        }
        applied
    }

    /// Wait for the next event on any child and apply it.
    pub async fn changed(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        let pending: Vec<_> = self
            .children
            .iter_mut()
            .filter_map(|(id, child)| {
                let id = id.clone();
                child
                    .active_feed()
                    .map(|feed| Box::pin(async move { (id, feed.next().await) }))
            })
            .collect();
        if pending.is_empty() {
            return false;
        }
        let ((id, event), _, rest) = select_all(pending).await;
        drop(rest);

        let Some(event) = event else {
            return false;
        };
        if let Some(child) = self.children.get_mut(&id) {
            child.apply(event);
        }
        self.publish();
        true
    }

    fn open_child(&mut self, id: &str) {
        let child = match self.collection.doc(id) {
            Ok(path) => {
                DocumentMirror::new(self.transport.clone(), Some(path), MirrorOptions::default())
            }
            Err(e) => {
                let mut child =
                    DocumentMirror::new(self.transport.clone(), None, MirrorOptions::default());
                child.fail(e);
                child
            }
        };
        if let Some(mut stale) = self.children.insert(id.to_string(), child) {
            stale.teardown();
        }
    }

    fn close_child(&mut self, id: &str) {
        if let Some(mut child) = self.children.remove(id) {
            child.teardown();
        }
    }

    fn publish(&self) {
        self.observers.send_replace(self.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::path::DocPath;
    use crate::transport::MemoryBackend;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    struct Member {
        id: String,
        name: String,
    }

    fn roster() -> (MemoryBackend, CollectionPath) {
        let backend = MemoryBackend::new();
        let col = CollectionPath::parse("users").unwrap();
        for (id, name) in [("a", "Ada"), ("b", "Bo"), ("c", "Cy")] {
            backend.seed(
                &col.doc(id).unwrap(),
                json!({ "name": name }).as_object().cloned().unwrap(),
            );
        }
        (backend, col)
    }

    fn names(state: &MirrorState<Vec<Entry<Member>>>) -> Vec<&str> {
        state.data.iter().map(|e| e.value.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_merges_in_insertion_order() {
        let (backend, col) = roster();
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["c", "a", "b"], MirrorOptions::default());
        assert!(fan.state().loading);
        assert!(fan.state().data.is_empty());

        fan.pump();
        let state = fan.state();
        assert!(!state.loading);
        assert_eq!(names(&state), vec!["Cy", "Ada", "Bo"]);
    }

    #[tokio::test]
    async fn test_absent_child_excluded() {
        let (backend, col) = roster();
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["a", "ghost"], MirrorOptions::default());
        fan.pump();
        let state = fan.state();
        assert_eq!(names(&state), vec!["Ada"]);
        assert!(state.error.is_none());
        assert_eq!(fan.child_status("ghost"), Some(&DocStatus::Absent));
    }

    #[tokio::test]
    async fn test_child_error_keeps_partial_result() {
        let (backend, col) = roster();
        backend.deny("users/b");
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["a", "b", "c"], MirrorOptions::default());
        fan.pump();
        let state = fan.state();
        assert_eq!(names(&state), vec!["Ada", "Cy"]);
        assert!(matches!(state.error, Some(SyncError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_invalid_id_surfaces_error() {
        let (backend, col) = roster();
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["a", "x/y"], MirrorOptions::default());
        fan.pump();
        let state = fan.state();
        assert_eq!(names(&state), vec!["Ada"]);
        assert!(matches!(state.error, Some(SyncError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_duplicate_ids_tracked_once() {
        let (backend, col) = roster();
        let fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["a", "a", "b"], MirrorOptions::default());
        assert_eq!(fan.ids(), &["a".to_string(), "b".to_string()]);
        assert_eq!(backend.opened(), 2);
    }

    #[tokio::test]
    async fn test_track_untrack() {
        let (backend, col) = roster();
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["a"], MirrorOptions::default());
        assert!(fan.track("b"));
        assert!(!fan.track("b"));
        assert!(fan.untrack("a"));
        assert!(!fan.untrack("a"));
        fan.pump();
        assert_eq!(names(&fan.state()), vec!["Bo"]);
        assert_eq!(backend.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_disabled_opens_nothing_until_enabled() {
        let (backend, col) = roster();
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(backend.connect(), col, ["a", "b"], MirrorOptions::disabled());
        assert_eq!(backend.opened(), 0);
        assert_eq!(fan.state(), MirrorState::default());

        fan.set_enabled(true);
        fan.pump();
        assert_eq!(names(&fan.state()), vec!["Ada", "Bo"]);

        fan.set_enabled(false);
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_changed_applies_child_update() {
        let (backend, col) = roster();
        let client = backend.connect();
        let mut fan: FanOutMirror<Member> =
            FanOutMirror::new(client.clone(), col, ["a"], MirrorOptions::default());
        fan.pump();

        let mut rx = fan.watch();
        client
            .write(
                &DocPath::parse("users/a").unwrap(),
                json!({ "name": "Ada L." }).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        assert!(fan.changed().await);
        assert_eq!(names(&rx.borrow_and_update()), vec!["Ada L."]);
    }
}
