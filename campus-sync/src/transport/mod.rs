//! Transport abstraction over the remote store.
//!
//! The store itself (persistence, authorization, query planning) lives
//! outside this crate. Anything that can open document/query/connectivity
//! feeds and apply writes can back the mirrors.

pub mod memory;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::SyncResult;
use crate::feed::{ChangeFeed, DocSnapshot, QuerySnapshot, Record};
use crate::path::{CollectionPath, DocPath};
use crate::query::QueryConstraints;

pub use memory::{MemoryBackend, MemoryTransport};

/// Key of the server-value sentinel object.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder the store replaces with its own clock (ms since epoch) when the
/// write is applied.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.len() == 1 && o.get(SERVER_VALUE_KEY) == Some(&json!("timestamp")))
}

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Write { path: DocPath, data: Record },
    Patch { path: DocPath, data: Record },
    Delete { path: DocPath },
}

impl BatchOp {
    pub fn path(&self) -> &DocPath {
        match self {
            BatchOp::Write { path, .. }
            | BatchOp::Patch { path, .. }
            | BatchOp::Delete { path } => path,
        }
    }
}

/// Contract the store collaborator implements.
///
/// Subscriptions return immediately; the first snapshot (or error) arrives
/// later on the feed. Mutations complete asynchronously.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a single document.
    fn subscribe_doc(&self, path: &DocPath) -> ChangeFeed<DocSnapshot>;

    /// Subscribe to a filtered, ordered, limited set of documents.
    fn subscribe_query(
        &self,
        collection: &CollectionPath,
        constraints: &QueryConstraints,
    ) -> ChangeFeed<QuerySnapshot>;

    /// Subscribe to the connection signal. The current state is delivered first.
    fn subscribe_connectivity(&self) -> ChangeFeed<bool>;

    /// Replace a document.
    async fn write(&self, path: &DocPath, data: Record) -> SyncResult<()>;

    /// Merge fields into an existing document.
    async fn patch(&self, path: &DocPath, data: Record) -> SyncResult<()>;

    async fn delete(&self, path: &DocPath) -> SyncResult<()>;

    /// Arm a server-side write that fires if this connection ends without
    /// explicit cleanup.
    async fn register_disconnect_hook(&self, path: &DocPath, data: Record) -> SyncResult<()>;

    /// Apply every operation or none.
    async fn batch_write(&self, ops: Vec<BatchOp>) -> SyncResult<()>;

    /// Whether `batch_write` is all-or-nothing on this store.
    fn supports_atomic_batch(&self) -> bool {
        true
    }
}
