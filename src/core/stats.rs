//! Event-sourced usage statistics.
//!
//! Every job outcome and user interaction lands here as one mutation:
//! cumulative counters and the current daily rollup are updated together,
//! then the whole snapshot is persisted. All mutations run behind one lock
//! (single-writer discipline); rolling active-user windows are computed on
//! read by scanning user records, which is O(users) and fine at this scale.

use crate::core::snapshot::SnapshotStore;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Statistics bucket a finished download is counted under.
///
/// Distinct from the file class: a song delivered from search results is
/// an audio file but counts as `Search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    /// Image download
    Image,
    /// Video download
    Video,
    /// Audio download
    Audio,
    /// Song picked from search results
    Search,
}

/// Cumulative download counters, one per kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadCounts {
    /// Images delivered
    #[serde(default)]
    pub image: u64,
    /// Videos delivered
    #[serde(default)]
    pub video: u64,
    /// Audio files delivered
    #[serde(default)]
    pub audio: u64,
    /// Songs delivered from search results
    #[serde(default)]
    pub search: u64,
}

impl DownloadCounts {
    /// Sum over all kinds; by invariant equal to `total_downloads`
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.image + self.video + self.audio + self.search
    }

    fn bump(&mut self, kind: DownloadKind) {
        match kind {
            DownloadKind::Image => self.image += 1,
            DownloadKind::Video => self.video += 1,
            DownloadKind::Audio => self.audio += 1,
            DownloadKind::Search => self.search += 1,
        }
    }
}

/// One known user. Created on first interaction, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Display name at last interaction
    pub name: String,
    /// Handle at last interaction
    pub username: String,
    /// First interaction, RFC 3339
    pub first_seen: String,
    /// Most recent interaction, RFC 3339
    pub last_seen: String,
    /// Interactions of any kind
    #[serde(default)]
    pub usage_count: u64,
    /// Successful downloads
    #[serde(default)]
    pub downloads: u64,
    /// Searches issued
    #[serde(default)]
    pub searches: u64,
    /// Failed jobs
    #[serde(default)]
    pub failures: u64,
}

/// Per-calendar-day rollup, created lazily on the first event of a day
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyStatsEntry {
    /// Downloads delivered that day
    #[serde(default)]
    pub downloads: u64,
    /// Searches issued that day
    #[serde(default)]
    pub searches: u64,
    /// Users first seen that day
    #[serde(default)]
    pub new_users: u64,
    /// Jobs failed that day
    #[serde(default)]
    pub failed: u64,
    /// Users active that day; the day's active-user count is always this
    /// set's cardinality, never a separate counter
    #[serde(default)]
    pub active_users: HashSet<i64>,
}

/// The full aggregate state, persisted whole after every mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Number of distinct users ever seen
    #[serde(default)]
    pub total_users: u64,
    /// All known users keyed by id
    #[serde(default)]
    pub users: HashMap<i64, UserRecord>,
    /// All successful downloads
    #[serde(default)]
    pub total_downloads: u64,
    /// Downloads by kind; sums to `total_downloads`
    #[serde(default)]
    pub downloads_by_kind: DownloadCounts,
    /// Downloads by source platform
    #[serde(default)]
    pub downloads_by_platform: HashMap<String, u64>,
    /// All searches ever issued
    #[serde(default)]
    pub total_searches: u64,
    /// All failed jobs
    #[serde(default)]
    pub failed_downloads: u64,
    /// Exact, case-sensitive search term frequencies
    #[serde(default)]
    pub search_terms: HashMap<String, u64>,
    /// Daily rollups keyed by `YYYY-MM-DD`
    #[serde(default)]
    pub daily: BTreeMap<String, DailyStatsEntry>,
    /// When this snapshot was first created, RFC 3339
    #[serde(default)]
    pub start_date: String,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            total_users: 0,
            users: HashMap::new(),
            total_downloads: 0,
            downloads_by_kind: DownloadCounts::default(),
            downloads_by_platform: HashMap::new(),
            total_searches: 0,
            failed_downloads: 0,
            search_terms: HashMap::new(),
            daily: BTreeMap::new(),
            start_date: Local::now().to_rfc3339(),
        }
    }
}

/// Rolling active-user window sizes, computed on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindows {
    /// Users active today
    pub today: usize,
    /// Users active within the last 7 days
    pub week: usize,
    /// Users active within the last 30 days
    pub month: usize,
}

impl StatsSnapshot {
    /// Scan all user records and bucket them by calendar-day distance of
    /// their last interaction from `now`.
    #[must_use]
    pub fn active_windows(&self, now: DateTime<Local>) -> ActiveWindows {
        let today = now.date_naive();
        let mut windows = ActiveWindows {
            today: 0,
            week: 0,
            month: 0,
        };

        for record in self.users.values() {
            let Ok(seen) = DateTime::parse_from_rfc3339(&record.last_seen) else {
                continue;
            };
            let days = (today - seen.date_naive()).num_days();
            if days < 0 {
                continue;
            }
            if days == 0 {
                windows.today += 1;
            }
            if days < 7 {
                windows.week += 1;
            }
            if days < 30 {
                windows.month += 1;
            }
        }

        windows
    }

    /// Users ranked by cumulative usage, descending. Ties keep their
    /// original order: records created earlier (by `first_seen`, then id)
    /// come first, so the ranking never reshuffles between reads.
    #[must_use]
    pub fn leaderboard(&self, limit: usize) -> Vec<(i64, &UserRecord)> {
        let mut ranked: Vec<(i64, &UserRecord)> =
            self.users.iter().map(|(id, rec)| (*id, rec)).collect();
        ranked.sort_by(|a, b| {
            b.1.usage_count
                .cmp(&a.1.usage_count)
                .then_with(|| a.1.first_seen.cmp(&b.1.first_seen))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }
}

/// Derive the source platform from a target URL for per-platform counters
#[must_use]
pub fn platform_from_url(url: &str) -> &'static str {
    let url = url.to_lowercase();
    if url.contains("youtube.") || url.contains("youtu.be") {
        "youtube"
    } else if url.contains("instagram.") {
        "instagram"
    } else if url.contains("tiktok.") {
        "tiktok"
    } else if url.contains("twitter.") || url.contains("//x.com") || url.contains("www.x.com") {
        "twitter"
    } else if url.contains("facebook.") || url.contains("fb.watch") {
        "facebook"
    } else if url.contains("pinterest.") {
        "pinterest"
    } else if url.contains("soundcloud.") {
        "soundcloud"
    } else {
        "other"
    }
}

/// Owner of the statistics state.
///
/// All mutations go through one internal lock and end with a whole-snapshot
/// save; a failed save is logged and the in-memory state stays
/// authoritative until the next mutation retries persistence.
pub struct StatsAggregator {
    inner: Mutex<StatsSnapshot>,
    store: Box<dyn SnapshotStore>,
}

impl StatsAggregator {
    /// Load persisted state from the store, falling back to a fresh
    /// snapshot when nothing was saved yet or the document is unreadable.
    pub async fn load(store: Box<dyn SnapshotStore>) -> Self {
        let snapshot = match store.load().await {
            Ok(Some(snapshot)) => {
                info!(
                    users = snapshot.users.len(),
                    downloads = snapshot.total_downloads,
                    "statistics snapshot loaded"
                );
                snapshot
            }
            Ok(None) => StatsSnapshot::default(),
            Err(e) => {
                warn!(error = %e, "statistics snapshot unreadable, starting fresh");
                StatsSnapshot::default()
            }
        };

        Self {
            inner: Mutex::new(snapshot),
            store,
        }
    }

    async fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut StatsSnapshot),
    {
        let mut state = self.inner.lock().await;
        apply(&mut state);
        if let Err(e) = self.store.save(&state).await {
            error!(error = %e, "failed to persist statistics snapshot");
        }
    }

    /// Record that a user interacted with the bot, creating their record
    /// on first contact.
    pub async fn record_user_seen(&self, user_id: i64, name: &str, username: &str) {
        let now = Local::now();
        self.mutate(|s| {
            let stamp = now.to_rfc3339();
            if let Some(record) = s.users.get_mut(&user_id) {
                record.last_seen = stamp;
                record.name = name.to_string();
                record.username = username.to_string();
            } else {
                s.total_users += 1;
                s.users.insert(
                    user_id,
                    UserRecord {
                        name: name.to_string(),
                        username: username.to_string(),
                        first_seen: stamp.clone(),
                        last_seen: stamp,
                        usage_count: 0,
                        downloads: 0,
                        searches: 0,
                        failures: 0,
                    },
                );
                day_entry(s, now).new_users += 1;
            }
            day_entry(s, now).active_users.insert(user_id);
        })
        .await;
    }

    /// Record one interaction (an admitted request of any kind)
    pub async fn record_usage(&self, user_id: i64) {
        let now = Local::now();
        self.mutate(|s| {
            touch_user(s, user_id, now).usage_count += 1;
            day_entry(s, now).active_users.insert(user_id);
        })
        .await;
    }

    /// Record one delivered download
    pub async fn record_download(&self, user_id: i64, kind: DownloadKind, platform: &str) {
        let now = Local::now();
        self.mutate(|s| {
            s.total_downloads += 1;
            s.downloads_by_kind.bump(kind);
            *s.downloads_by_platform
                .entry(platform.to_string())
                .or_insert(0) += 1;
            touch_user(s, user_id, now).downloads += 1;
            let day = day_entry(s, now);
            day.downloads += 1;
            day.active_users.insert(user_id);
        })
        .await;
    }

    /// Record one search, counting the exact term
    pub async fn record_search(&self, user_id: i64, term: &str) {
        let now = Local::now();
        self.mutate(|s| {
            s.total_searches += 1;
            *s.search_terms.entry(term.to_string()).or_insert(0) += 1;
            touch_user(s, user_id, now).searches += 1;
            let day = day_entry(s, now);
            day.searches += 1;
            day.active_users.insert(user_id);
        })
        .await;
    }

    /// Record one terminally failed job
    pub async fn record_failure(&self, user_id: i64) {
        let now = Local::now();
        self.mutate(|s| {
            s.failed_downloads += 1;
            touch_user(s, user_id, now).failures += 1;
            let day = day_entry(s, now);
            day.failed += 1;
            day.active_users.insert(user_id);
        })
        .await;
    }

    /// Read-only copy of the full aggregate state
    pub async fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().await.clone()
    }

    /// All known user ids, for admin broadcast fan-out
    pub async fn broadcast_targets(&self) -> Vec<i64> {
        self.inner.lock().await.users.keys().copied().collect()
    }

    /// Human-readable statistics report for the /stats command
    pub async fn report(&self) -> String {
        let snapshot = self.snapshot().await;
        render_report(&snapshot, Local::now())
    }
}

fn day_entry(s: &mut StatsSnapshot, now: DateTime<Local>) -> &mut DailyStatsEntry {
    let key = now.format("%Y-%m-%d").to_string();
    s.daily.entry(key).or_default()
}

fn touch_user(s: &mut StatsSnapshot, user_id: i64, now: DateTime<Local>) -> &mut UserRecord {
    let stamp = now.to_rfc3339();
    let record = s.users.entry(user_id).or_insert_with(|| {
        // Seen through an event before any /start: count them anyway
        UserRecord {
            name: "Unknown".to_string(),
            username: "unknown".to_string(),
            first_seen: stamp.clone(),
            last_seen: stamp.clone(),
            usage_count: 0,
            downloads: 0,
            searches: 0,
            failures: 0,
        }
    });
    record.last_seen = stamp;
    record
}

fn render_report(s: &StatsSnapshot, now: DateTime<Local>) -> String {
    let windows = s.active_windows(now);
    let mut out = String::new();

    let _ = writeln!(out, "📊 Bot statistics\n");
    let _ = writeln!(out, "👥 Users:");
    let _ = writeln!(out, "• total: {}", s.total_users);
    let _ = writeln!(
        out,
        "• active today / 7d / 30d: {} / {} / {}\n",
        windows.today, windows.week, windows.month
    );

    let _ = writeln!(out, "📥 Downloads: {}", s.total_downloads);
    let _ = writeln!(out, "  - images: {}", s.downloads_by_kind.image);
    let _ = writeln!(out, "  - videos: {}", s.downloads_by_kind.video);
    let _ = writeln!(out, "  - audio: {}", s.downloads_by_kind.audio);
    let _ = writeln!(out, "  - songs (search): {}\n", s.downloads_by_kind.search);

    let _ = writeln!(out, "🔍 Searches: {}", s.total_searches);
    let _ = writeln!(out, "❌ Failed jobs: {}\n", s.failed_downloads);

    let _ = writeln!(out, "🏆 Most active users:");
    let leaders = s.leaderboard(crate::config::LEADERBOARD_SIZE);
    if leaders.is_empty() {
        let _ = writeln!(out, "  none yet");
    }
    for (rank, (_, rec)) in leaders.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {}. {} (@{}) - {} uses",
            rank + 1,
            rec.name,
            rec.username,
            rec.usage_count
        );
    }

    let start = s.start_date.get(..10).unwrap_or(&s.start_date);
    let _ = write!(out, "\n📅 Since: {start}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::MockSnapshotStore;
    use chrono::Duration;

    async fn aggregator() -> StatsAggregator {
        let mut store = MockSnapshotStore::new();
        store.expect_load().returning(|| Ok(None));
        store.expect_save().returning(|_| Ok(()));
        StatsAggregator::load(Box::new(store)).await
    }

    #[tokio::test]
    async fn test_download_totals_stay_consistent() {
        let stats = aggregator().await;
        stats.record_download(1, DownloadKind::Video, "youtube").await;
        stats.record_download(1, DownloadKind::Video, "tiktok").await;
        stats.record_download(2, DownloadKind::Audio, "youtube").await;
        stats.record_download(3, DownloadKind::Search, "youtube").await;

        let s = stats.snapshot().await;
        assert_eq!(s.total_downloads, 4);
        assert_eq!(s.total_downloads, s.downloads_by_kind.total());
        assert_eq!(s.downloads_by_platform.get("youtube"), Some(&3));
        assert_eq!(s.downloads_by_platform.get("tiktok"), Some(&1));
    }

    #[tokio::test]
    async fn test_daily_active_set_deduplicates() {
        let stats = aggregator().await;
        stats.record_usage(7).await;
        stats.record_usage(7).await;
        stats.record_download(7, DownloadKind::Image, "instagram").await;
        stats.record_failure(7).await;

        let s = stats.snapshot().await;
        let (_, day) = s.daily.iter().next_back().expect("today's entry");
        assert_eq!(day.active_users.len(), 1);
        assert!(day.active_users.contains(&7));
    }

    #[tokio::test]
    async fn test_new_user_counted_once() {
        let stats = aggregator().await;
        stats.record_user_seen(5, "Ada", "ada").await;
        stats.record_user_seen(5, "Ada", "ada").await;

        let s = stats.snapshot().await;
        assert_eq!(s.total_users, 1);
        let (_, day) = s.daily.iter().next_back().expect("today's entry");
        assert_eq!(day.new_users, 1);
    }

    #[tokio::test]
    async fn test_search_terms_are_exact_and_case_sensitive() {
        let stats = aggregator().await;
        stats.record_search(1, "Believer").await;
        stats.record_search(1, "Believer").await;
        stats.record_search(1, "believer").await;

        let s = stats.snapshot().await;
        assert_eq!(s.search_terms.get("Believer"), Some(&2));
        assert_eq!(s.search_terms.get("believer"), Some(&1));
        assert_eq!(s.total_searches, 3);
    }

    #[test]
    fn test_active_windows_bucketing() {
        let now = Local::now();
        let mut s = StatsSnapshot::default();
        let mut add = |id: i64, days_ago: i64| {
            let seen = now - Duration::days(days_ago);
            s.users.insert(
                id,
                UserRecord {
                    name: "u".to_string(),
                    username: "u".to_string(),
                    first_seen: seen.to_rfc3339(),
                    last_seen: seen.to_rfc3339(),
                    usage_count: 1,
                    downloads: 0,
                    searches: 0,
                    failures: 0,
                },
            );
        };
        add(1, 0);
        add(2, 3);
        add(3, 10);
        add(4, 40);

        let windows = s.active_windows(now);
        assert_eq!(
            windows,
            ActiveWindows {
                today: 1,
                week: 2,
                month: 3,
            }
        );
    }

    #[test]
    fn test_leaderboard_order_is_stable_on_ties() {
        let mut s = StatsSnapshot::default();
        let mut add = |id: i64, usage: u64, first_seen: &str| {
            s.users.insert(
                id,
                UserRecord {
                    name: format!("user{id}"),
                    username: format!("u{id}"),
                    first_seen: first_seen.to_string(),
                    last_seen: first_seen.to_string(),
                    usage_count: usage,
                    downloads: 0,
                    searches: 0,
                    failures: 0,
                },
            );
        };
        add(10, 5, "2024-01-03T00:00:00+00:00");
        add(20, 9, "2024-01-01T00:00:00+00:00");
        add(30, 5, "2024-01-02T00:00:00+00:00");

        let ranked: Vec<i64> = s.leaderboard(5).iter().map(|(id, _)| *id).collect();
        // Highest usage first; the tie between 10 and 30 resolves to the
        // record that existed first
        assert_eq!(ranked, vec![20, 30, 10]);
    }

    #[test]
    fn test_platform_from_url() {
        assert_eq!(platform_from_url("https://www.youtube.com/watch?v=1"), "youtube");
        assert_eq!(platform_from_url("https://youtu.be/abc"), "youtube");
        assert_eq!(platform_from_url("https://www.instagram.com/p/x/"), "instagram");
        assert_eq!(platform_from_url("https://x.com/u/status/1"), "twitter");
        assert_eq!(platform_from_url("https://example.com/clip"), "other");
    }

    #[test]
    fn test_report_renders_leaderboard_and_windows() {
        let mut s = StatsSnapshot::default();
        s.total_users = 1;
        s.total_downloads = 2;
        s.downloads_by_kind.video = 2;
        s.users.insert(
            1,
            UserRecord {
                name: "Ada".to_string(),
                username: "ada".to_string(),
                first_seen: Local::now().to_rfc3339(),
                last_seen: Local::now().to_rfc3339(),
                usage_count: 4,
                downloads: 2,
                searches: 0,
                failures: 0,
            },
        );

        let report = render_report(&s, Local::now());
        assert!(report.contains("Downloads: 2"));
        assert!(report.contains("1. Ada (@ada) - 4 uses"));
        assert!(report.contains("active today / 7d / 30d: 1 / 1 / 1"));
    }
}
