//! Mirrors: local, continuously-updated copies of remote state.
//!
//! ```text
//! Transport ──► ChangeFeed ──► Mirror::pump() / Mirror::changed()
//!                                   │  replaces local state per snapshot
//!                                   ▼
//!                        watch::Sender<MirrorState<D>> ──► observers
//! ```
//!
//! - [`DocumentMirror`]: one document
//! - [`SetMirror`]: ordered query result
//! - [`FanOutMirror`]: dynamic set of documents merged into one list
//!
//! Mirrors are driven by their owner: `pump()` applies every event already
//! queued, `changed().await` waits for and applies the next one. Nothing is
//! applied after `teardown()`.

pub mod document;
pub mod fanout;
pub mod set;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::feed::Record;

pub use document::{DocStatus, DocumentMirror};
pub use fanout::{FanOutChange, FanOutMirror};
pub use set::SetMirror;

/// What a consumer renders: data, a loading flag, and the last error.
///
/// An empty, successfully subscribed result is `loading == false`,
/// `error == None` with empty data.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorState<D> {
    pub data: D,
    pub loading: bool,
    pub error: Option<SyncError>,
}

impl<D: Default> Default for MirrorState<D> {
    fn default() -> Self {
        Self {
            data: D::default(),
            loading: false,
            error: None,
        }
    }
}

/// A decoded document together with its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub id: String,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorOptions {
    /// A disabled mirror holds no subscription and reports idle state.
    pub enabled: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MirrorOptions {
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Decode a record into `T`, exposing the document id as an `id` field
/// unless the record already carries one.
pub(crate) fn decode<T: DeserializeOwned>(id: &str, mut data: Record) -> SyncResult<T> {
    data.entry("id")
        .or_insert_with(|| Value::String(id.to_string()));
    Ok(serde_json::from_value(Value::Object(data))?)
}
