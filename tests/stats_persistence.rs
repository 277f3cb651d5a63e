//! The statistics snapshot must survive a restart: everything recorded
//! through one aggregator is visible after reloading the same file.

use clip_courier::core::snapshot::{JsonFileStore, SnapshotStore};
use clip_courier::core::stats::{DownloadKind, StatsAggregator};

#[tokio::test]
async fn recorded_events_survive_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bot_stats.json");

    {
        let stats = StatsAggregator::load(Box::new(JsonFileStore::new(path.clone()))).await;
        stats.record_user_seen(1, "Ada", "ada").await;
        stats.record_usage(1).await;
        stats.record_download(1, DownloadKind::Video, "youtube").await;
        stats.record_search(1, "some song").await;
        stats.record_failure(1).await;
    }

    let reloaded = StatsAggregator::load(Box::new(JsonFileStore::new(path.clone()))).await;
    let snapshot = reloaded.snapshot().await;

    assert_eq!(snapshot.total_users, 1);
    assert_eq!(snapshot.total_downloads, 1);
    assert_eq!(snapshot.downloads_by_kind.video, 1);
    assert_eq!(snapshot.total_downloads, snapshot.downloads_by_kind.total());
    assert_eq!(snapshot.total_searches, 1);
    assert_eq!(snapshot.failed_downloads, 1);
    assert_eq!(snapshot.downloads_by_platform.get("youtube"), Some(&1));

    let user = snapshot.users.get(&1).expect("user record");
    assert_eq!(user.usage_count, 1);
    assert_eq!(user.downloads, 1);
    assert_eq!(user.searches, 1);
    assert_eq!(user.failures, 1);

    // One calendar day, one deduplicated active user
    assert_eq!(snapshot.daily.len(), 1);
    let day = snapshot.daily.values().next().expect("daily entry");
    assert_eq!(day.active_users.len(), 1);
    assert_eq!(day.new_users, 1);
    assert_eq!(day.downloads, 1);
    assert_eq!(day.failed, 1);
}

#[tokio::test]
async fn broadcast_targets_cover_all_known_users() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bot_stats.json");

    let stats = StatsAggregator::load(Box::new(JsonFileStore::new(path))).await;
    stats.record_user_seen(1, "a", "a").await;
    stats.record_user_seen(2, "b", "b").await;
    stats.record_usage(3).await;

    let mut targets = stats.broadcast_targets().await;
    targets.sort_unstable();
    assert_eq!(targets, vec![1, 2, 3]);
}

#[tokio::test]
async fn saved_document_is_valid_json_with_expected_shape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bot_stats.json");

    let stats = StatsAggregator::load(Box::new(JsonFileStore::new(path.clone()))).await;
    stats.record_download(9, DownloadKind::Image, "instagram").await;

    let raw = std::fs::read_to_string(&path).expect("snapshot file");
    let doc: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(doc["total_downloads"], 1);
    assert_eq!(doc["downloads_by_kind"]["image"], 1);
    assert!(doc["users"]["9"].is_object());

    // The store must also read back what it wrote
    let store = JsonFileStore::new(path);
    let loaded = store.load().await.expect("load").expect("snapshot");
    assert_eq!(loaded.total_downloads, 1);
}
