//! Presence protocol: "this session is online, doing X".
//!
//! ## Architecture
//!
//! ```text
//! Transport::subscribe_connectivity()
//!       │ true                          │ false
//!       ▼                               ▼
//! register_disconnect_hook(offline)   state = Disconnected
//! write(online, activity)             (the armed hook corrects the record
//!       │                              server-side)
//!       ▼
//! presence/<session>  ◄── other sessions write here too
//!       │
//!       ▼  SetMirror over the whole namespace
//! AggregatePresence::fold()  ──►  watch::Sender<AggregatePresence>
//! ```
//!
//! One record per session, not per user. The namespace is handed in as a
//! [`PresenceNamespace`] capability so several deployments (or tests) can
//! run side by side.
//!
//! ## Session State Machine
//!
//! ```text
//! Disconnected ──connectivity=true──► Connecting ──hook armed + written──► Online(activity)
//!      ▲                                   │                                   │
//!      └──────────── write failed ─────────┘◄────── connectivity=false ────────┘
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::feed::{ChangeFeed, FeedEvent, Record};
use crate::mirror::{MirrorOptions, SetMirror};
use crate::path::{CollectionPath, DocPath};
use crate::query::QueryConstraints;
use crate::transport::{server_timestamp, Transport};

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// What a session is currently doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    Idle,
    Browsing,
    Learning,
    Assessment,
    Messaging,
    /// Written by a client with an activity this one does not know.
    #[serde(other)]
    Other,
}

impl Activity {
    /// The activities a tracker publishes itself.
    pub const ALL: [Activity; 5] = [
        Activity::Idle,
        Activity::Browsing,
        Activity::Learning,
        Activity::Assessment,
        Activity::Messaging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Idle => "idle",
            Activity::Browsing => "browsing",
            Activity::Learning => "learning",
            Activity::Assessment => "assessment",
            Activity::Messaging => "messaging",
            Activity::Other => "other",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One session's entry in the presence namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub online: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub activity: Activity,
    pub session_id: String,
    /// Owning user; one user may hold several sessions.
    #[serde(default)]
    pub user_id: String,
}

/// Summary of the presence namespace. Derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePresence {
    pub online_total: usize,
    pub per_activity: BTreeMap<Activity, usize>,
    /// Distinct users with at least one online session.
    pub unique_users: usize,
}

impl AggregatePresence {
    /// Fold visible records into counts. O(n) in the number of records.
    ///
    /// With `stale_after`, an online record whose `last_seen` is older than
    /// the window counts as offline.
    pub fn fold<'a, I>(records: I, now: DateTime<Utc>, stale_after: Option<Duration>) -> Self
    where
        I: IntoIterator<Item = &'a PresenceRecord>,
    {
        let cutoff_ms = stale_after.map(|d| now.timestamp_millis() - d.as_millis() as i64);
        let mut aggregate = Self::default();
        let mut users = HashSet::new();
        for record in records {
            if !record.online {
                continue;
            }
            if cutoff_ms.is_some_and(|cutoff| record.last_seen.timestamp_millis() < cutoff) {
                continue;
            }
            aggregate.online_total += 1;
            *aggregate.per_activity.entry(record.activity).or_insert(0) += 1;
            let user = if record.user_id.is_empty() {
                &record.session_id
            } else {
                &record.user_id
            };
            users.insert(user.as_str());
        }
        aggregate.unique_users = users.len();
        aggregate
    }

    /// Online sessions doing `activity` (zero when absent).
    pub fn count(&self, activity: Activity) -> usize {
        self.per_activity.get(&activity).copied().unwrap_or(0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Namespace capability
// ───────────────────────────────────────────────────────────────────

/// Scoped handle to "the presence namespace for this deployment".
#[derive(Clone)]
pub struct PresenceNamespace {
    transport: Arc<dyn Transport>,
    root: CollectionPath,
}

impl PresenceNamespace {
    pub fn new(transport: Arc<dyn Transport>, root: CollectionPath) -> Self {
        Self { transport, root }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &SyncConfig) -> SyncResult<Self> {
        Ok(Self::new(transport, config.presence_path()?))
    }

    pub fn root(&self) -> &CollectionPath {
        &self.root
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn session_path(&self, session_id: &str) -> SyncResult<DocPath> {
        self.root.doc(session_id)
    }
}

impl fmt::Debug for PresenceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceNamespace").field("root", &self.root).finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Local view of this session's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Disconnected,
    Connecting,
    Online(Activity),
}

/// Publishes this session's presence and aggregates the namespace.
///
/// Driven by its owner like the mirrors: `pump()` handles whatever is queued,
/// `changed()` waits for the next connectivity or namespace event. Call
/// [`teardown`](Self::teardown) on clean exit; dropping without it leaves the
/// correction to the server-side disconnect hook.
pub struct PresenceTracker {
    namespace: PresenceNamespace,
    session_id: String,
    user_id: String,
    path: DocPath,
    activity: Activity,
    state: PresenceState,
    /// Set once the online record has been written at least once.
    published: bool,
    connectivity: Option<ChangeFeed<bool>>,
    sessions: SetMirror<PresenceRecord>,
    stale_after: Option<Duration>,
    aggregate: AggregatePresence,
    observers: watch::Sender<AggregatePresence>,
    torn_down: bool,
}

enum Wake {
    Connectivity(FeedEvent<bool>),
    Namespace,
}

impl PresenceTracker {
    /// Track a fresh session (random v4 id) for `user_id`.
    pub fn new(
        namespace: PresenceNamespace,
        user_id: impl Into<String>,
        activity: Activity,
    ) -> SyncResult<Self> {
        Self::with_session_id(namespace, Uuid::new_v4().to_string(), user_id, activity)
    }

    pub fn with_session_id(
        namespace: PresenceNamespace,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        activity: Activity,
    ) -> SyncResult<Self> {
        let session_id = session_id.into();
        let path = namespace.session_path(&session_id)?;
        let transport = namespace.transport().clone();
        let connectivity = transport.subscribe_connectivity();
        let sessions = SetMirror::new(
            transport,
            namespace.root().clone(),
            QueryConstraints::new(),
            MirrorOptions::default(),
        );
        let (observers, _) = watch::channel(AggregatePresence::default());
        log::info!("presence tracker for session {session_id} in {}", namespace.root());
        Ok(Self {
            namespace,
            session_id,
            user_id: user_id.into(),
            path,
            activity,
            state: PresenceState::Disconnected,
            published: false,
            connectivity: Some(connectivity),
            sessions,
            stale_after: None,
            aggregate: AggregatePresence::default(),
            observers,
            torn_down: false,
        })
    }

    /// Count online records older than `window` as offline.
    pub fn with_stale_after(mut self, window: Option<Duration>) -> Self {
        self.stale_after = window;
        self.refold();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    /// Activity that is (or will be, once online) published.
    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn aggregate(&self) -> &AggregatePresence {
        &self.aggregate
    }

    pub fn online_total(&self) -> usize {
        self.aggregate.online_total
    }

    pub fn per_activity_counts(&self) -> &BTreeMap<Activity, usize> {
        &self.aggregate.per_activity
    }

    /// Whether the namespace subscription has delivered yet.
    pub fn loading(&self) -> bool {
        self.sessions.loading()
    }

    /// Last error of the namespace subscription.
    pub fn error(&self) -> Option<&SyncError> {
        self.sessions.error()
    }

    pub fn watch(&self) -> watch::Receiver<AggregatePresence> {
        self.observers.subscribe()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Change the published activity. Online status is unchanged; while not
    /// online only the desired activity is stored.
    pub async fn update_activity(&mut self, activity: Activity) -> SyncResult<()> {
        if self.torn_down {
            log::warn!("update_activity on a torn-down tracker ignored");
            return Ok(());
        }
        let previous = std::mem::replace(&mut self.activity, activity);
        if let PresenceState::Online(_) = self.state {
            let transport = self.namespace.transport().clone();
            if let Err(e) = transport.write(&self.path, self.record(true)).await {
                log::warn!("session {} kept {previous}: {e}", self.session_id);
                self.activity = previous;
                return Err(e);
            }
            self.state = PresenceState::Online(activity);
            log::debug!("session {} now {activity}", self.session_id);
        }
        Ok(())
    }

    /// Handle every queued event. Returns how many were applied.
    pub async fn pump(&mut self) -> SyncResult<usize> {
        if self.torn_down {
            return Ok(0);
        }
        let mut applied = 0;
        let mut connectivity = Ok(());
        while let Some(event) = self.connectivity.as_mut().and_then(ChangeFeed::try_next) {
            applied += 1;
            if let Err(e) = self.on_connectivity(event).await {
                connectivity = Err(e);
                break;
            }
        }
        // The namespace is folded even when connectivity failed.
        let delivered = self.sessions.pump();
        if delivered > 0 {
            self.refold();
        }
        connectivity.map(|()| applied + delivered)
    }

    /// Wait for the next connectivity or namespace event and handle it.
    /// Returns `false` once nothing is left to wait on.
    pub async fn changed(&mut self) -> SyncResult<bool> {
        if self.torn_down {
            return Ok(false);
        }
        let wake = {
            let connectivity = self.connectivity.as_mut().filter(|f| f.is_active());
            let sessions = &mut self.sessions;
            tokio::select! {
                Some(event) = async move {
                    match connectivity {
                        Some(feed) => feed.next().await,
                        None => None,
                    }
                } => Wake::Connectivity(event),
                true = sessions.changed() => Wake::Namespace,
                else => return Ok(false),
            }
        };
        match wake {
            Wake::Connectivity(event) => self.on_connectivity(event).await?,
            Wake::Namespace => self.refold(),
        }
        Ok(true)
    }

    /// Clean exit: write the offline record, then release both
    /// subscriptions. Idempotent; the subscriptions are released even when
    /// the write fails.
    pub async fn teardown(&mut self) -> SyncResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let result = if self.published {
            let transport = self.namespace.transport().clone();
            transport.write(&self.path, self.record(false)).await
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            log::warn!("offline write for session {} failed: {e}", self.session_id);
        }
        if let Some(mut feed) = self.connectivity.take() {
            feed.cancel();
        }
        self.sessions.teardown();
        self.state = PresenceState::Disconnected;
        log::info!("presence tracker for session {} torn down", self.session_id);
        result
    }

    async fn on_connectivity(&mut self, event: FeedEvent<bool>) -> SyncResult<()> {
        match event {
            FeedEvent::Snapshot(true) => self.go_online().await,
            FeedEvent::Snapshot(false) => {
                if self.state != PresenceState::Disconnected {
                    log::info!("session {} lost connectivity", self.session_id);
                    self.state = PresenceState::Disconnected;
                }
                Ok(())
            }
            FeedEvent::Error(e) => {
                if let Some(mut feed) = self.connectivity.take() {
                    feed.cancel();
                }
                self.state = PresenceState::Disconnected;
                Err(e)
            }
        }
    }

    /// Arm the offline hook first, then announce. A crash between the two
    /// leaves no online record behind.
    async fn go_online(&mut self) -> SyncResult<()> {
        if let PresenceState::Online(_) = self.state {
            return Ok(());
        }
        self.state = PresenceState::Connecting;
        let transport = self.namespace.transport().clone();

        let mut hook = Record::new();
        hook.insert("online".into(), Value::Bool(false));
        hook.insert("lastSeen".into(), server_timestamp());
        let announced = match transport.register_disconnect_hook(&self.path, hook).await {
            Ok(()) => transport.write(&self.path, self.record(true)).await,
            Err(e) => Err(e),
        };
        match announced {
            Ok(()) => {
                self.published = true;
                self.state = PresenceState::Online(self.activity);
                log::info!("session {} online ({})", self.session_id, self.activity);
                Ok(())
            }
            Err(e) => {
                log::warn!("session {} failed to go online: {e}", self.session_id);
                self.state = PresenceState::Disconnected;
                Err(e)
            }
        }
    }

    fn record(&self, online: bool) -> Record {
        let mut record = Record::new();
        record.insert("online".into(), Value::Bool(online));
        record.insert("lastSeen".into(), server_timestamp());
        record.insert("activity".into(), Value::from(self.activity.as_str()));
        record.insert("sessionId".into(), Value::from(self.session_id.as_str()));
        record.insert("userId".into(), Value::from(self.user_id.as_str()));
        record
    }

    fn refold(&mut self) {
        let aggregate = AggregatePresence::fold(
            self.sessions.data().iter().map(|e| &e.value),
            Utc::now(),
            self.stale_after,
        );
        if aggregate != self.aggregate {
            log::trace!(
                "{}: {} online across {} users",
                self.namespace.root(),
                aggregate.online_total,
                aggregate.unique_users
            );
        }
        self.aggregate = aggregate;
        self.observers.send_replace(self.aggregate.clone());
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if !self.torn_down && self.published {
            log::warn!(
                "session {} dropped without teardown; relying on disconnect hook",
                self.session_id
            );
        }
    }
}
