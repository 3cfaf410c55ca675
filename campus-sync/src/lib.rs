//! # campus-sync: Real-time mirror layer for the learning platform
//!
//! Keeps local state in step with a remote document store: single documents,
//! query results and dynamic document sets, plus session presence and a
//! per-user notification list with optimistic commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐ subscribe_*  ┌──────────────┐
//! │ Transport (trait)│ ───────────► │ ChangeFeed<T>│  snapshot | error
//! │ MemoryTransport  │              └──────┬───────┘
//! └────────▲─────────┘                     │ pump() / changed()
//!          │ write / patch / batch         ▼
//!          │                ┌────────────────────────────────┐
//!          │                │ DocumentMirror  SetMirror       │
//!          │                │ FanOutMirror (DocumentMirror×N) │
//!          │                └──────┬──────────────────┬───────┘
//!          │                       │                  │
//!  ┌───────┴─────────────┐  ┌──────┴──────────┐  ┌────┴──────────────┐
//!  │ NotificationSync.   │──┘ PresenceTracker │  │ watch observers   │
//!  │ (optimistic cmds)   │  │ (hook + fold)   │  │ MirrorState<D>    │
//!  └─────────────────────┘  └─────────────────┘  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`feed`]: per-subscription snapshot channel with idempotent cancel
//! - [`transport`]: store contract and the in-memory implementation
//! - [`query`]: query constraints, validation and evaluation
//! - [`mirror`]: document, set and fan-out mirrors
//! - [`presence`]: session presence and namespace aggregation
//! - [`notifications`]: notification list with read/delete commands
//! - [`config`]: collection names and limits

pub mod config;
pub mod error;
pub mod feed;
pub mod mirror;
pub mod notifications;
pub mod path;
pub mod presence;
pub mod query;
pub mod transport;

// Re-exports for convenience
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use feed::{ChangeFeed, DocSnapshot, FeedEvent, FeedSender, FeedState, QuerySnapshot, Record};
pub use mirror::{
    DocStatus, DocumentMirror, Entry, FanOutChange, FanOutMirror, MirrorOptions, MirrorState,
    SetMirror,
};
pub use notifications::{
    NotificationKind, NotificationOptions, NotificationRecord, NotificationSynchronizer, Priority,
};
pub use path::{CollectionPath, DocPath};
pub use presence::{
    Activity, AggregatePresence, PresenceNamespace, PresenceRecord, PresenceState, PresenceTracker,
};
pub use query::{Direction, Filter, FilterOp, OrderBy, QueryConstraints};
pub use transport::{server_timestamp, BatchOp, MemoryBackend, MemoryTransport, Transport};
