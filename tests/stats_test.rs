// Proof-of-play and CMS log persistence.

use std::sync::Arc;

use time::macros::datetime;

use signage_engine::clock::ManualClock;
use signage_engine::db::Db;
use signage_engine::logs::{LogEntry, LogLevelFilter, LogStore};
use signage_engine::stats::{records_xml, StatKey, StatType, StatsStore};

fn key(schedule_id: i64, layout_id: i64, media_id: Option<&str>) -> StatKey {
    StatKey {
        schedule_id,
        layout_id,
        media_id: media_id.map(str::to_string),
        kind: if media_id.is_some() { StatType::Media } else { StatType::Layout },
    }
}

async fn stats(dir: &tempfile::TempDir) -> (Arc<ManualClock>, StatsStore) {
    let clock = Arc::new(ManualClock::new(datetime!(2025-01-15 10:00:00)));
    let db = Db::open(dir.path().join("engine.db")).await.unwrap();
    (clock.clone(), StatsStore::new(db, clock))
}

#[tokio::test]
async fn open_is_idempotent_and_close_measures_duration() {
    let dir = tempfile::tempdir().unwrap();
    let (clock, stats) = stats(&dir).await;

    let id = stats.open_stat(key(3, 12, None), None).await.unwrap();
    let again = stats.open_stat(key(3, 12, None), None).await.unwrap();
    assert_eq!(id, again);

    // Still open: nothing to report yet.
    assert!(stats.pending(10).await.unwrap().is_empty());

    clock.advance(time::Duration::seconds(30));
    let closed = stats.close_stat(key(3, 12, None)).await.unwrap().unwrap();
    assert_eq!(closed.id, id);
    assert_eq!(closed.duration, 30);
    assert_eq!(closed.todt.as_deref(), Some("2025-01-15 10:00:30"));

    let pending = stats.pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].is_open());

    // Closing again finds nothing open.
    assert!(stats.close_stat(key(3, 12, None)).await.unwrap().is_none());
}

#[tokio::test]
async fn media_id_is_part_of_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let (_clock, stats) = stats(&dir).await;

    let layout = stats.open_stat(key(3, 12, None), None).await.unwrap();
    let media = stats.open_stat(key(3, 12, Some("44")), Some("promo".into())).await.unwrap();
    assert_ne!(layout, media);

    let closed = stats.close_stat(key(3, 12, Some("44"))).await.unwrap().unwrap();
    assert_eq!(closed.tag.as_deref(), Some("promo"));

    let xml = records_xml(&stats.pending(10).await.unwrap());
    assert!(xml.contains(r#"type="media" scheduleid="3" layoutid="12" mediaid="44""#));
    assert!(xml.contains(r#"tag="promo""#));
}

#[tokio::test]
async fn submitted_stats_are_deleted_and_stale_ones_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let (clock, stats) = stats(&dir).await;

    stats.open_stat(key(1, 1, None), None).await.unwrap();
    stats.close_stat(key(1, 1, None)).await.unwrap();
    stats.open_stat(key(2, 2, None), None).await.unwrap();

    let ids: Vec<i64> = stats.pending(10).await.unwrap().iter().map(|s| s.id).collect();
    assert_eq!(stats.delete(ids).await.unwrap(), 1);
    assert!(stats.pending(10).await.unwrap().is_empty());

    clock.advance(time::Duration::hours(25));
    assert_eq!(stats.cleanup_stale(24 * 3600).await.unwrap(), 1);
    assert!(stats.close_stat(key(2, 2, None)).await.unwrap().is_none());
}

#[tokio::test]
async fn log_filter_and_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("engine.db")).await.unwrap();
    let logs = LogStore::new(db);

    let date = "2025-01-15 10:00:00".to_string();
    logs.insert_many(vec![
        LogEntry::new("audit", "collected", date.clone()),
        LogEntry::new("error", "download failed", date.clone()),
        LogEntry::new("event", "layout started", date.clone()),
    ])
    .await
    .unwrap();
    assert_eq!(logs.count().await.unwrap(), 3);

    let error_level = logs.fetch(LogLevelFilter::Error, 10).await.unwrap();
    let categories: Vec<_> = error_level.iter().map(|e| e.category.as_str()).collect();
    assert_eq!(categories, vec!["error", "event"]);

    let off = logs.fetch(LogLevelFilter::Off, 10).await.unwrap();
    assert_eq!(off.len(), 1);
    assert_eq!(off[0].message, "layout started");

    assert_eq!(logs.discard_filtered(LogLevelFilter::Error).await.unwrap(), 1);
    assert_eq!(logs.count().await.unwrap(), 2);

    let oldest = logs.fetch(LogLevelFilter::All, 1).await.unwrap();
    assert_eq!(logs.delete(oldest.iter().map(|e| e.id).collect()).await.unwrap(), 1);
    assert_eq!(logs.count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_share_one_open_stat() {
    let dir = tempfile::tempdir().unwrap();
    let (_clock, stats) = stats(&dir).await;

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let stats = stats.clone();
        set.spawn(async move { stats.open_stat(key(5, 7, None), None).await });
    }

    let mut ids = std::collections::HashSet::new();
    while let Some(joined) = set.join_next().await {
        ids.insert(joined.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 1);

    // The open key can be reused once the play is closed.
    let first = *ids.iter().next().unwrap();
    assert_eq!(stats.close_stat(key(5, 7, None)).await.unwrap().unwrap().id, first);
    let next = stats.open_stat(key(5, 7, None), None).await.unwrap();
    assert_ne!(next, first);
}
