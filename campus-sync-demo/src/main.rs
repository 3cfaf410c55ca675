//! campus-sync demo: runs the notification and presence flows against the
//! in-memory backend.
//!
//! `RUST_LOG=debug cargo run -p campus-sync-demo` shows every subscription
//! being opened, reconciled and cancelled.

use log::info;
use serde_json::json;

use campus_sync::{
    Activity, MemoryBackend, NotificationOptions, NotificationSynchronizer, PresenceNamespace,
    PresenceTracker, Record, SyncConfig, SyncResult,
};

fn notification(recipient: &str, title: &str, read: bool, created_at: i64) -> Record {
    let mut record = Record::new();
    record.insert("recipient".into(), json!(recipient));
    record.insert("kind".into(), json!("course_update"));
    record.insert("title".into(), json!(title));
    record.insert("read".into(), json!(read));
    record.insert("createdAt".into(), json!(created_at));
    record
}

async fn notifications_demo(backend: &MemoryBackend, config: &SyncConfig) -> SyncResult<()> {
    let collection = config.notifications_path()?;
    let now = chrono::Utc::now().timestamp_millis();
    let titles = ["Lesson 4 is live", "Quiz graded", "New reply", "Welcome", "Profile updated"];
    for (i, title) in titles.iter().enumerate() {
        let path = collection.doc(&format!("n{}", i + 1))?;
        backend.seed(&path, notification("u1", title, i >= 3, now - i as i64 * 60_000));
    }

    let options = NotificationOptions::default();
    let mut inbox = NotificationSynchronizer::new(backend.connect(), config, "u1", options)?;
    inbox.pump();
    info!("u1 has {} notifications, {} unread", inbox.notifications().len(), inbox.unread_count());

    inbox.mark_all_read().await?;
    info!("after mark_all_read (optimistic): {} unread", inbox.unread_count());

    inbox.pump();
    for entry in inbox.notifications() {
        let read_at = entry
            .value
            .read_at
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        info!("  {} {:<18} read={} at {read_at}", entry.id, entry.value.title, entry.value.read);
    }
    info!("confirmed: {} unread", inbox.unread_count());

    inbox.teardown();
    Ok(())
}

async fn presence_demo(backend: &MemoryBackend, config: &SyncConfig) -> SyncResult<()> {
    let alice_conn = backend.connect();
    let bob_conn = backend.connect();

    let mut alice = PresenceTracker::new(
        PresenceNamespace::from_config(alice_conn.clone(), config)?,
        "alice",
        Activity::Learning,
    )?;
    let mut bob = PresenceTracker::new(
        PresenceNamespace::from_config(bob_conn, config)?,
        "bob",
        Activity::Browsing,
    )?
    .with_stale_after(config.presence_stale_after());

    alice.pump().await?;
    bob.pump().await?;
    info!("online: {:?}", bob.aggregate());

    alice.update_activity(Activity::Assessment).await?;
    bob.pump().await?;
    info!("alice started an assessment: {:?}", bob.per_activity_counts());

    // Alice's laptop lid closes: no teardown, the server hook cleans up.
    alice_conn.drop_connection();
    alice.pump().await?;
    bob.pump().await?;
    info!("after alice dropped: {} online ({:?})", bob.online_total(), alice.state());

    bob.teardown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> SyncResult<()> {
    env_logger::init();

    info!("Starting campus-sync demo...");

    let config = SyncConfig::default();
    let backend = MemoryBackend::new();

    notifications_demo(&backend, &config).await?;
    presence_demo(&backend, &config).await?;

    info!("Demo finished");
    Ok(())
}
