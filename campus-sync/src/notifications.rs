//! NotificationSynchronizer: a recipient's notification list with
//! optimistic read/delete commands.
//!
//! ```text
//!   mark_read / delete ...
//!        │ 1. local change (before any await)
//!        ▼
//!   SetMirror<NotificationRecord> ──► unread_count recomputed
//!        │ 2. remote patch / delete / batch
//!        ▼
//!   Transport ──► next snapshot overwrites the local list
//! ```
//!
//! There is no rollback step. If a write fails, the optimistic value stays
//! visible until the next snapshot replaces it, and the command returns the
//! error so the caller can react.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::feed::Record;
use crate::mirror::{Entry, MirrorOptions, MirrorState, SetMirror};
use crate::path::{CollectionPath, DocPath};
use crate::query::{Direction, FilterOp, QueryConstraints};
use crate::transport::{server_timestamp, BatchOp, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CourseUpdate,
    Assignment,
    Grade,
    Message,
    Achievement,
    Announcement,
    System,
    /// Any kind this client does not know about yet.
    #[serde(other)]
    Other,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::CourseUpdate => "course_update",
            NotificationKind::Assignment => "assignment",
            NotificationKind::Grade => "grade",
            NotificationKind::Message => "message",
            NotificationKind::Achievement => "achievement",
            NotificationKind::Announcement => "announcement",
            NotificationKind::System => "system",
            NotificationKind::Other => "other",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    #[serde(other)]
    Normal,
    High,
    Urgent,
}

/// A notification as stored remotely. Produced elsewhere; this layer only
/// touches `read`/`read_at` and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub recipient: String,
    pub kind: NotificationKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub read: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Priority,
    /// Deep link the client opens on click.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_ref: Option<String>,
}

/// Which notifications to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationOptions {
    /// Page size; `None` uses the configured default.
    pub limit: Option<usize>,
    pub unread_only: bool,
    pub kind: Option<NotificationKind>,
    pub enabled: bool,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            limit: None,
            unread_only: false,
            kind: None,
            enabled: true,
        }
    }
}

fn constraints(
    recipient: &str,
    options: &NotificationOptions,
    default_limit: usize,
) -> QueryConstraints {
    let mut query = QueryConstraints::new().filter("recipient", FilterOp::Eq, recipient);
    if options.unread_only {
        query = query.filter("read", FilterOp::Eq, false);
    }
    if let Some(kind) = options.kind {
        query = query.filter("kind", FilterOp::Eq, kind.as_str());
    }
    query
        .order_by("createdAt", Direction::Desc)
        .limit(options.limit.unwrap_or(default_limit))
}

fn read_patch() -> Record {
    let mut patch = Record::new();
    patch.insert("read".into(), Value::Bool(true));
    patch.insert("readAt".into(), server_timestamp());
    patch
}

fn dedup<I>(ids: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.as_ref().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Notification list of one recipient plus read/delete commands.
pub struct NotificationSynchronizer {
    transport: Arc<dyn Transport>,
    collection: CollectionPath,
    recipient: String,
    options: NotificationOptions,
    default_limit: usize,
    mirror: SetMirror<NotificationRecord>,
    unread: usize,
}

impl NotificationSynchronizer {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &SyncConfig,
        recipient: impl Into<String>,
        options: NotificationOptions,
    ) -> SyncResult<Self> {
        let collection = config.notifications_path()?;
        let recipient = recipient.into();
        let default_limit = config.notification_limit;
        let mirror = SetMirror::new(
            transport.clone(),
            collection.clone(),
            constraints(&recipient, &options, default_limit),
            MirrorOptions { enabled: options.enabled },
        );
        log::debug!("notifications for {recipient} from {collection}");
        Ok(Self {
            transport,
            collection,
            recipient,
            options,
            default_limit,
            mirror,
            unread: 0,
        })
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn options(&self) -> &NotificationOptions {
        &self.options
    }

    pub fn notifications(&self) -> &[Entry<NotificationRecord>] {
        self.mirror.data()
    }

    /// Unread records in the visible list. Always consistent with
    /// [`notifications`](Self::notifications).
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn loading(&self) -> bool {
        self.mirror.loading()
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.mirror.error()
    }

    pub fn state(&self) -> MirrorState<Vec<Entry<NotificationRecord>>> {
        self.mirror.state()
    }

    pub fn watch(&self) -> watch::Receiver<MirrorState<Vec<Entry<NotificationRecord>>>> {
        self.mirror.watch()
    }

    pub fn is_subscribed(&self) -> bool {
        self.mirror.is_subscribed()
    }

    /// Change filters or page size. Re-subscribes only when the resulting
    /// query differs.
    pub fn set_options(&mut self, options: NotificationOptions) -> bool {
        let query = constraints(&self.recipient, &options, self.default_limit);
        // Disable before swapping constraints, enable after.
        let changed = if options.enabled {
            let changed = self.mirror.set_constraints(query);
            self.mirror.set_enabled(true);
            changed
        } else {
            self.mirror.set_enabled(false);
            self.mirror.set_constraints(query)
        };
        self.options = options;
        self.recount();
        changed
    }

    pub fn refresh(&mut self) {
        self.mirror.refresh();
        self.recount();
    }

    pub fn teardown(&mut self) {
        self.mirror.teardown();
    }

    pub fn pump(&mut self) -> usize {
        let applied = self.mirror.pump();
        if applied > 0 {
            self.recount();
        }
        applied
    }

    pub async fn changed(&mut self) -> bool {
        let changed = self.mirror.changed().await;
        if changed {
            self.recount();
        }
        changed
    }

    // ───────────────────────────────────────────────────────────────
    // Commands
    // ───────────────────────────────────────────────────────────────

    pub async fn mark_read(&mut self, id: &str) -> SyncResult<()> {
        let path = self.collection.doc(id)?;
        let now = Utc::now();
        self.modify_local(|items| {
            for entry in items.iter_mut().filter(|e| e.id == id) {
                entry.value.read = true;
                entry.value.read_at = Some(now);
            }
        });
        let transport = self.transport.clone();
        transport.patch(&path, read_patch()).await.inspect_err(|e| {
            log::warn!("mark_read {path} failed: {e}");
        })
    }

    /// Mark several records read in one batch.
    pub async fn mark_many_read<I>(&mut self, ids: I) -> SyncResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let ids = dedup(ids);
        let paths = self.paths(&ids)?;
        if paths.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.modify_local(|items| {
            for entry in items.iter_mut().filter(|e| wanted.contains(e.id.as_str())) {
                entry.value.read = true;
                entry.value.read_at = Some(now);
            }
        });
        let ops = paths
            .into_iter()
            .map(|path| BatchOp::Patch { path, data: read_patch() })
            .collect();
        self.send_batch(ops).await
    }

    /// Mark every currently visible unread record read. Records arriving
    /// after this call are not affected.
    pub async fn mark_all_read(&mut self) -> SyncResult<()> {
        let unread: Vec<String> = self
            .notifications()
            .iter()
            .filter(|e| !e.value.read)
            .map(|e| e.id.clone())
            .collect();
        self.mark_many_read(unread).await
    }

    pub async fn delete(&mut self, id: &str) -> SyncResult<()> {
        let path = self.collection.doc(id)?;
        self.modify_local(|items| items.retain(|e| e.id != id));
        let transport = self.transport.clone();
        transport.delete(&path).await.inspect_err(|e| {
            log::warn!("delete {path} failed: {e}");
        })
    }

    pub async fn delete_many<I>(&mut self, ids: I) -> SyncResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let ids = dedup(ids);
        let paths = self.paths(&ids)?;
        if paths.is_empty() {
            return Ok(());
        }
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.modify_local(|items| items.retain(|e| !doomed.contains(e.id.as_str())));
        let ops = paths.into_iter().map(|path| BatchOp::Delete { path }).collect();
        self.send_batch(ops).await
    }

    /// Delete every currently visible record.
    pub async fn clear_all(&mut self) -> SyncResult<()> {
        let ids: Vec<String> = self.notifications().iter().map(|e| e.id.clone()).collect();
        self.delete_many(ids).await
    }

    fn paths(&self, ids: &[String]) -> SyncResult<Vec<DocPath>> {
        ids.iter().map(|id| self.collection.doc(id)).collect()
    }

    fn modify_local(&mut self, f: impl FnOnce(&mut Vec<Entry<NotificationRecord>>)) {
        self.mirror.modify_local(f);
        self.recount();
    }

    fn recount(&mut self) {
        self.unread = self.mirror.data().iter().filter(|e| !e.value.read).count();
    }

    /// Atomic when the store allows it. Otherwise one write per operation;
    /// any failure is reported without claiming which ones landed.
    async fn send_batch(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        let transport = self.transport.clone();
        if transport.supports_atomic_batch() {
            return transport.batch_write(ops).await.inspect_err(|e| {
                log::warn!("batch of {} on {} failed: {e}", self.collection, self.recipient);
            });
        }

        let attempted = ops.len();
        let mut failed = 0;
        let mut last_error = None;
        for op in ops {
            let result = match op {
                BatchOp::Write { path, data } => transport.write(&path, data).await,
                BatchOp::Patch { path, data } => transport.patch(&path, data).await,
                BatchOp::Delete { path } => transport.delete(&path).await,
            };
            if let Err(e) = result {
                failed += 1;
                last_error = Some(e);
            }
        }
        match last_error {
            None => Ok(()),
            Some(e) if failed == attempted => Err(e),
            Some(_) => {
                log::warn!("non-atomic batch: {failed} of {attempted} operations failed");
                Err(SyncError::PartialBatchFailure { attempted, failed })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBackend;
    use serde_json::json;

    fn seed(backend: &MemoryBackend, id: &str, recipient: &str, read: bool, created: i64) {
        let path = DocPath::parse(&format!("notifications/{id}")).unwrap();
        let data = json!({
            "recipient": recipient,
            "kind": "grade",
            "title": format!("note {id}"),
            "read": read,
            "createdAt": created,
        });
        backend.seed(&path, data.as_object().cloned().unwrap());
    }

    fn ids(sync: &NotificationSynchronizer) -> Vec<&str> {
        sync.notifications().iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_constraints_shape() {
        let options = NotificationOptions {
            unread_only: true,
            kind: Some(NotificationKind::Message),
            ..Default::default()
        };
        let query = constraints("u1", &options, 50);
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["where"].as_array().unwrap().len(), 3);
        assert_eq!(json["orderBy"][0]["field"], "createdAt");
        assert_eq!(json["orderBy"][0]["direction"], "desc");
        assert_eq!(json["limit"], 50);
    }

    #[test]
    fn test_record_decodes_optional_fields() {
        let raw = json!({
            "id": "n1",
            "recipient": "u1",
            "kind": "course_update",
            "title": "New lesson",
            "createdAt": 1_700_000_000_000i64,
            "readAt": 1_700_000_100_000i64,
            "priority": "high",
        });
        let rec: NotificationRecord = serde_json::from_value(raw).unwrap();
        assert!(!rec.read);
        assert_eq!(rec.priority, Priority::High);
        assert_eq!(rec.read_at.map(|t| t.timestamp_millis()), Some(1_700_000_100_000));
        assert_eq!(rec.action_ref, None);
    }

    #[test]
    fn test_unknown_kind_and_priority_still_decode() {
        let raw = json!({
            "id": "n2",
            "recipient": "u1",
            "kind": "certificate_issued",
            "createdAt": 1_700_000_000_000i64,
            "priority": "critical",
        });
        let rec: NotificationRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(rec.kind, NotificationKind::Other);
        assert_eq!(rec.priority, Priority::Normal);
        assert_eq!(rec.title, "");
    }

    #[tokio::test]
    async fn test_newest_first_for_recipient() {
        let backend = MemoryBackend::new();
        seed(&backend, "a", "u1", false, 1);
        seed(&backend, "b", "u2", false, 2);
        seed(&backend, "c", "u1", true, 3);
        let mut sync = NotificationSynchronizer::new(
            backend.connect(),
            &SyncConfig::default(),
            "u1",
            NotificationOptions::default(),
        )
        .unwrap();
        assert!(sync.loading());
        sync.pump();
        assert_eq!(ids(&sync), vec!["c", "a"]);
        assert_eq!(sync.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_unread_decrements_count() {
        let backend = MemoryBackend::new();
        seed(&backend, "a", "u1", false, 1);
        seed(&backend, "b", "u1", false, 2);
        let mut sync = NotificationSynchronizer::new(
            backend.connect(),
            &SyncConfig::default(),
            "u1",
            NotificationOptions::default(),
        )
        .unwrap();
        sync.pump();
        assert_eq!(sync.unread_count(), 2);

        sync.delete("a").await.unwrap();
        assert_eq!(ids(&sync), vec!["b"]);
        assert_eq!(sync.unread_count(), 1);
        sync.pump();
        assert_eq!(ids(&sync), vec!["b"]);
    }

    #[tokio::test]
    async fn test_empty_id_list_is_noop() {
        let backend = MemoryBackend::new();
        let mut sync = NotificationSynchronizer::new(
            backend.connect(),
            &SyncConfig::default(),
            "u1",
            NotificationOptions::default(),
        )
        .unwrap();
        sync.pump();
        backend.fail_writes(Some(SyncError::WriteFailure("down".into())));
        sync.mark_many_read(Vec::<String>::new()).await.unwrap();
        sync.mark_all_read().await.unwrap();
        sync.clear_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_before_local_change() {
        let backend = MemoryBackend::new();
        seed(&backend, "a", "u1", false, 1);
        let mut sync = NotificationSynchronizer::new(
            backend.connect(),
            &SyncConfig::default(),
            "u1",
            NotificationOptions::default(),
        )
        .unwrap();
        sync.pump();
        let err = sync.mark_many_read(["a", "x/y"]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));
        assert_eq!(sync.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_kind_filter_change_resubscribes() {
        let backend = MemoryBackend::new();
        seed(&backend, "a", "u1", false, 1);
        let mut sync = NotificationSynchronizer::new(
            backend.connect(),
            &SyncConfig::default(),
            "u1",
            NotificationOptions::default(),
        )
        .unwrap();
        sync.pump();
        assert!(!sync.set_options(NotificationOptions::default()));
        assert!(sync.set_options(NotificationOptions {
            kind: Some(NotificationKind::Message),
            ..Default::default()
        }));
        sync.pump();
        assert!(sync.notifications().is_empty());
        assert_eq!(sync.unread_count(), 0);
        assert_eq!(backend.opened(), 2);
        assert_eq!(backend.closed(), 1);
    }
}
