//! In-memory store: one shared [`MemoryBackend`] (the "server") and any
//! number of [`MemoryTransport`] connections to it (the "clients").
//!
//! ```text
//!   MemoryTransport (session A) ──┐
//!                                 ├── MemoryBackend ── docs + live subscriptions
//!   MemoryTransport (session B) ──┘        │
//!                                          └── re-evaluates every subscription
//!                                              after each committed mutation
//! ```
//!
//! Every mutation re-runs the affected subscriptions and pushes a snapshot
//! when the visible result changed. Disconnect hooks are armed per connection
//! and fire when [`MemoryTransport::drop_connection`] simulates an unclean
//! exit. Failure injection and open/close counters exist for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{is_server_timestamp, BatchOp, Transport};
use crate::error::{SyncError, SyncResult};
use crate::feed::{ChangeFeed, DocSnapshot, FeedSender, QuerySnapshot, Record};
use crate::path::{CollectionPath, DocPath};
use crate::query::QueryConstraints;

type Collections = BTreeMap<CollectionPath, BTreeMap<String, Record>>;

struct DocSub {
    path: DocPath,
    sender: FeedSender<DocSnapshot>,
    last: Option<DocSnapshot>,
}

struct QuerySub {
    collection: CollectionPath,
    constraints: QueryConstraints,
    sender: FeedSender<QuerySnapshot>,
    last: Option<QuerySnapshot>,
}

#[derive(Default)]
struct BackendState {
    collections: Collections,
    doc_subs: HashMap<u64, DocSub>,
    query_subs: HashMap<u64, QuerySub>,
    next_id: u64,
    opened: usize,
    closed: usize,
    denied_prefixes: Vec<String>,
    rejected_prefixes: Vec<String>,
    write_failure: Option<SyncError>,
}

impl BackendState {
    fn doc_snapshot(&self, path: &DocPath) -> DocSnapshot {
        self.collections
            .get(&path.parent())
            .and_then(|c| c.get(path.id()))
            .map_or_else(DocSnapshot::absent, |r| DocSnapshot::present(r.clone()))
    }

    fn query_snapshot(
        &self,
        collection: &CollectionPath,
        constraints: &QueryConstraints,
    ) -> QuerySnapshot {
        match self.collections.get(collection) {
            Some(docs) => QuerySnapshot::new(constraints.execute(docs.iter())),
            None => QuerySnapshot::default(),
        }
    }

    fn is_denied(&self, path: &str) -> bool {
        self.denied_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn check_write(&self, path: &DocPath) -> SyncResult<()> {
        let raw = path.to_string();
        if self.is_denied(&raw) {
            return Err(SyncError::PermissionDenied(raw));
        }
        if let Some(e) = &self.write_failure {
            return Err(e.clone());
        }
        if self.rejected_prefixes.iter().any(|p| raw.starts_with(p.as_str())) {
            return Err(SyncError::WriteFailure(format!("write to {raw} rejected")));
        }
        Ok(())
    }

    /// Push fresh snapshots to every subscription whose result changed.
    fn publish(&mut self, force: bool) {
        let mut dead = Vec::new();
        let doc_updates: Vec<(u64, DocSnapshot)> = self
            .doc_subs
            .iter()
            .map(|(id, sub)| (*id, self.doc_snapshot(&sub.path)))
            .collect();
        for (id, snap) in doc_updates {
            if let Some(sub) = self.doc_subs.get_mut(&id) {
                if force || sub.last.as_ref() != Some(&snap) {
                    sub.last = Some(snap.clone());
                    if !sub.sender.snapshot(snap) {
                        dead.push(id);
                    }
                }
            }
        }
        for id in dead.drain(..) {
            self.doc_subs.remove(&id);
        }

        let query_updates: Vec<(u64, QuerySnapshot)> = self
            .query_subs
            .iter()
            .map(|(id, sub)| (*id, self.query_snapshot(&sub.collection, &sub.constraints)))
            .collect();
        for (id, snap) in query_updates {
            if let Some(sub) = self.query_subs.get_mut(&id) {
                if force || sub.last.as_ref() != Some(&snap) {
                    sub.last = Some(snap.clone());
                    if !sub.sender.snapshot(snap) {
                        dead.push(id);
                    }
                }
            }
        }
        for id in dead {
            self.query_subs.remove(&id);
        }
    }
}

fn resolve_server_values(record: &mut Record, now_ms: i64) {
    for value in record.values_mut() {
        resolve_value(value, now_ms);
    }
}

fn resolve_value(value: &mut Value, now_ms: i64) {
    if is_server_timestamp(value) {
        *value = Value::from(now_ms);
        return;
    }
    match value {
        Value::Object(map) => resolve_server_values(map, now_ms),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_value(v, now_ms)),
        _ => {}
    }
}

fn apply_op(collections: &mut Collections, op: BatchOp, now_ms: i64) -> SyncResult<()> {
    match op {
        BatchOp::Write { path, mut data } => {
            resolve_server_values(&mut data, now_ms);
            collections
                .entry(path.parent())
                .or_default()
                .insert(path.id().to_string(), data);
        }
        BatchOp::Patch { path, mut data } => {
            resolve_server_values(&mut data, now_ms);
            let existing = collections
                .get_mut(&path.parent())
                .and_then(|c| c.get_mut(path.id()))
                .ok_or_else(|| SyncError::WriteFailure(format!("no document at {path}")))?;
            existing.extend(data);
        }
        BatchOp::Delete { path } => {
            if let Some(c) = collections.get_mut(&path.parent()) {
                c.remove(path.id());
            }
        }
    }
    Ok(())
}

/// Shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new client connection to this backend.
    pub fn connect(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            backend: self.clone(),
            conn: Mutex::new(Connection {
                connected: true,
                hooks: Vec::new(),
                listeners: HashMap::new(),
                next_id: 0,
            }),
            atomic_batches: Mutex::new(true),
        })
    }

    /// Write a document directly, bypassing failure injection.
    pub fn seed(&self, path: &DocPath, data: Record) {
        let mut state = self.lock();
        let now = Utc::now().timestamp_millis();
        let _ = apply_op(&mut state.collections, BatchOp::Write { path: path.clone(), data }, now);
        state.publish(false);
    }

    /// Current stored value of a document.
    pub fn get(&self, path: &DocPath) -> Option<Record> {
        self.lock().doc_snapshot(path).data
    }

    /// Number of documents stored in a collection.
    pub fn count(&self, collection: &CollectionPath) -> usize {
        self.lock().collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Document and query subscriptions opened so far.
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Document and query subscriptions cancelled so far.
    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    /// Subscriptions currently registered.
    pub fn active_subscriptions(&self) -> usize {
        let state = self.lock();
        state.doc_subs.len() + state.query_subs.len()
    }

    /// Reject reads and writes under a path prefix with `PermissionDenied`.
    pub fn deny(&self, prefix: &str) {
        self.lock().denied_prefixes.push(prefix.to_string());
    }

    /// Reject writes under a path prefix with `WriteFailure`.
    pub fn reject_writes_to(&self, prefix: &str) {
        self.lock().rejected_prefixes.push(prefix.to_string());
    }

    /// Fail every mutation with `error` until cleared with `None`.
    pub fn fail_writes(&self, error: Option<SyncError>) {
        self.lock().write_failure = error;
    }

    /// Re-send the current result to every subscription, changed or not.
    pub fn republish(&self) {
        self.lock().publish(true);
    }

    /// Fail every live subscription with `error` (e.g. a network drop).
    pub fn fail_subscriptions(&self, error: SyncError) {
        let mut state = self.lock();
        for (_, sub) in state.doc_subs.drain() {
            sub.sender.error(error.clone());
        }
        for (_, sub) in state.query_subs.drain() {
            sub.sender.error(error.clone());
        }
    }

    fn mutate(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        let mut state = self.lock();
        for op in &ops {
            state.check_write(op.path())?;
        }
        let now = Utc::now().timestamp_millis();
        let mut staged = state.collections.clone();
        for op in ops {
            apply_op(&mut staged, op, now)?;
        }
        state.collections = staged;
        state.publish(false);
        Ok(())
    }

    fn subscribe_doc(&self, path: &DocPath) -> ChangeFeed<DocSnapshot> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.opened += 1;

        let backend = self.clone();
        let (sender, feed) =
            ChangeFeed::open(format!("doc:{path}"), move || backend.unsubscribe(id));

        if state.is_denied(&path.to_string()) {
            sender.error(SyncError::PermissionDenied(path.to_string()));
            return feed;
        }
        let snap = state.doc_snapshot(path);
        sender.snapshot(snap.clone());
        state.doc_subs.insert(
            id,
            DocSub {
                path: path.clone(),
                sender,
                last: Some(snap),
            },
        );
        feed
    }

    fn subscribe_query(
        &self,
        collection: &CollectionPath,
        constraints: &QueryConstraints,
    ) -> ChangeFeed<QuerySnapshot> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.opened += 1;

        let backend = self.clone();
        let (sender, feed) =
            ChangeFeed::open(format!("query:{collection}"), move || backend.unsubscribe(id));

        if state.is_denied(&collection.to_string()) {
            sender.error(SyncError::PermissionDenied(collection.to_string()));
            return feed;
        }
        if let Err(e) = constraints.validate() {
            sender.error(e);
            return feed;
        }
        let snap = state.query_snapshot(collection, constraints);
        sender.snapshot(snap.clone());
        state.query_subs.insert(
            id,
            QuerySub {
                collection: collection.clone(),
                constraints: constraints.clone(),
                sender,
                last: Some(snap),
            },
        );
        feed
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.lock();
        state.closed += 1;
        state.doc_subs.remove(&id);
        state.query_subs.remove(&id);
    }
}

struct Connection {
    connected: bool,
    hooks: Vec<(DocPath, Record)>,
    listeners: HashMap<u64, FeedSender<bool>>,
    next_id: u64,
}

impl Connection {
    fn notify(&mut self) {
        let connected = self.connected;
        self.listeners.retain(|_, l| l.snapshot(connected));
    }
}

/// One client connection to a [`MemoryBackend`].
pub struct MemoryTransport {
    backend: MemoryBackend,
    conn: Mutex<Connection>,
    atomic_batches: Mutex<bool>,
}

impl MemoryTransport {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    pub fn is_connected(&self) -> bool {
        self.conn().connected
    }

    /// Disconnect hooks currently armed on this connection.
    pub fn armed_hooks(&self) -> usize {
        self.conn().hooks.len()
    }

    /// Simulate an unclean exit: the server runs the armed hooks, the client
    /// sees connectivity drop.
    pub fn drop_connection(&self) {
        let hooks = {
            let mut conn = self.conn();
            if !conn.connected {
                return;
            }
            conn.connected = false;
            conn.notify();
            std::mem::take(&mut conn.hooks)
        };
        log::debug!("connection dropped, firing {} disconnect hooks", hooks.len());
        // Hooks run server-side: they bypass client failure injection and
        // merge into the record, creating it if it was deleted meanwhile.
        let mut state = self.backend.lock();
        let now = Utc::now().timestamp_millis();
        for (path, mut data) in hooks {
            resolve_server_values(&mut data, now);
            state
                .collections
                .entry(path.parent())
                .or_default()
                .entry(path.id().to_string())
                .or_default()
                .extend(data);
        }
        state.publish(false);
    }

    /// Restore connectivity after [`drop_connection`](Self::drop_connection).
    pub fn reconnect(&self) {
        let mut conn = self.conn();
        if conn.connected {
            return;
        }
        conn.connected = true;
        conn.notify();
    }

    /// Make `batch_write` report non-atomic support.
    pub fn set_atomic_batches(&self, atomic: bool) {
        *self.atomic_batches.lock().unwrap_or_else(PoisonError::into_inner) = atomic;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn subscribe_doc(&self, path: &DocPath) -> ChangeFeed<DocSnapshot> {
        self.backend.subscribe_doc(path)
    }

    fn subscribe_query(
        &self,
        collection: &CollectionPath,
        constraints: &QueryConstraints,
    ) -> ChangeFeed<QuerySnapshot> {
        self.backend.subscribe_query(collection, constraints)
    }

    fn subscribe_connectivity(&self) -> ChangeFeed<bool> {
        let mut conn = self.conn();
        let id = conn.next_id;
        conn.next_id += 1;
        let (sender, feed) = ChangeFeed::open("connectivity", || {});
        sender.snapshot(conn.connected);
        conn.listeners.insert(id, sender);
        feed
    }

    async fn write(&self, path: &DocPath, data: Record) -> SyncResult<()> {
        self.backend.mutate(vec![BatchOp::Write { path: path.clone(), data }])
    }

    async fn patch(&self, path: &DocPath, data: Record) -> SyncResult<()> {
        self.backend.mutate(vec![BatchOp::Patch { path: path.clone(), data }])
    }

    async fn delete(&self, path: &DocPath) -> SyncResult<()> {
        self.backend.mutate(vec![BatchOp::Delete { path: path.clone() }])
    }

    async fn register_disconnect_hook(&self, path: &DocPath, data: Record) -> SyncResult<()> {
        self.backend.lock().check_write(path)?;
        let mut conn = self.conn();
        if !conn.connected {
            return Err(SyncError::Transport("not connected".into()));
        }
        conn.hooks.retain(|(p, _)| p != path);
        conn.hooks.push((path.clone(), data));
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        self.backend.mutate(ops)
    }

    fn supports_atomic_batch(&self) -> bool {
        *self.atomic_batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
