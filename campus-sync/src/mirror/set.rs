//! SetMirror: ordered local list of documents matching a query.
//!
//! Each snapshot replaces the whole list, in the order the feed delivered it.
//! Constraints are compared structurally: handing in an equal value (a fresh
//! but identical builder chain, say) keeps the current subscription.

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::{decode, Entry, MirrorOptions, MirrorState};
use crate::error::SyncError;
use crate::feed::{ChangeFeed, FeedEvent, QuerySnapshot};
use crate::path::CollectionPath;
use crate::query::QueryConstraints;
use crate::transport::Transport;

/// Mirror of a query result, decoded into `T`.
pub struct SetMirror<T> {
    transport: Arc<dyn Transport>,
    collection: CollectionPath,
    constraints: QueryConstraints,
    enabled: bool,
    feed: Option<ChangeFeed<QuerySnapshot>>,
    items: Vec<Entry<T>>,
    loading: bool,
    error: Option<SyncError>,
    observers: watch::Sender<MirrorState<Vec<Entry<T>>>>,
    torn_down: bool,
}

impl<T> SetMirror<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        transport: Arc<dyn Transport>,
        collection: CollectionPath,
        constraints: QueryConstraints,
        options: MirrorOptions,
    ) -> Self {
        let (observers, _) = watch::channel(MirrorState::default());
        let mut mirror = Self {
            transport,
            collection,
            constraints,
            enabled: options.enabled,
            feed: None,
            items: Vec::new(),
            loading: false,
            error: None,
            observers,
            torn_down: false,
        };
        mirror.resubscribe();
        mirror
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn constraints(&self) -> &QueryConstraints {
        &self.constraints
    }

    pub fn data(&self) -> &[Entry<T>] {
        &self.items
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn state(&self) -> MirrorState<Vec<Entry<T>>> {
        MirrorState {
            data: self.items.clone(),
            loading: self.loading,
            error: self.error.clone(),
        }
    }

    pub fn watch(&self) -> watch::Receiver<MirrorState<Vec<Entry<T>>>> {
        self.observers.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.feed.as_ref().is_some_and(ChangeFeed::is_active)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Replace the constraints. Returns `true` when this re-subscribed.
    pub fn set_constraints(&mut self, constraints: QueryConstraints) -> bool {
        if self.constraints == constraints {
            return false;
        }
        log::debug!("constraints on {} changed, re-subscribing", self.collection);
        self.constraints = constraints;
        self.resubscribe();
        true
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.resubscribe();
    }

    pub fn refresh(&mut self) {
        self.resubscribe();
    }

    /// Cancel the subscription for good. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
    }

    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.feed.as_mut().and_then(ChangeFeed::try_next) {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    pub async fn changed(&mut self) -> bool {
        let Some(feed) = self.feed.as_mut().filter(|f| f.is_active()) else {
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

    /// Mutate the local list in place (optimistic updates by the owner).
    /// The next snapshot overwrites whatever this did.
    pub(crate) fn modify_local(&mut self, f: impl FnOnce(&mut Vec<Entry<T>>)) {
        if self.torn_down {
            return;
        }
        f(&mut self.items);
        self.publish();
    }

    fn apply(&mut self, event: FeedEvent<QuerySnapshot>) {
        if self.torn_down {
            return;
        }
        match event {
            FeedEvent::Snapshot(snap) => {
                let mut seen = HashSet::with_capacity(snap.docs.len());
                let mut items = Vec::with_capacity(snap.docs.len());
                for (id, data) in snap.docs {
                    if !seen.insert(id.clone()) {
                        log::warn!("duplicate id {id} in snapshot of {}", self.collection);
                        continue;
                    }
                    match decode::<T>(&id, data) {
                        Ok(value) => items.push(Entry { id, value }),
                        Err(e) => log::warn!("skipping {}/{id}: {e}", self.collection),
                    }
                }
                log::trace!("{} snapshot: {} items", self.collection, items.len());
                self.items = items;
                self.loading = false;
                self.error = None;
            }
            FeedEvent::Error(e) => {
                if let Some(mut feed) = self.feed.take() {
                    feed.cancel();
                }
                self.loading = false;
                self.error = Some(e);
            }
        }
        self.publish();
    }

    fn resubscribe(&mut self) {
        if self.torn_down {
            log::warn!("resubscribe on a torn-down set mirror ignored");
            return;
        }
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
        self.items.clear();
        self.error = None;
        self.loading = false;

        if self.enabled {
            match self.constraints.validate() {
                Ok(()) => {
                    log::debug!("set mirror subscribing to {}", self.collection);
                    let feed = self.transport.subscribe_query(&self.collection, &self.constraints);
                    self.feed = Some(feed);
                    self.loading = true;
                }
                Err(e) => {
                    log::warn!("not subscribing to {}: {e}", self.collection);
                    self.error = Some(e);
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.observers.send_replace(MirrorState {
            data: self.items.clone(),
            loading: self.loading,
            error: self.error.clone(),
        });
    }
}

impl<T> Drop for SetMirror<T> {
    fn drop(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
    }
}
