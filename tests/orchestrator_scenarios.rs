//! End-to-end scenarios for the job pipeline, with a scripted extractor
//! and a recording delivery in place of yt-dlp and Telegram.

use async_trait::async_trait;
use clip_courier::core::error::JobError;
use clip_courier::core::lifecycle::Delivery;
use clip_courier::core::orchestrator::{
    JobOutcome, JobRequest, Orchestrator, OrchestratorConfig,
};
use clip_courier::core::retry::RetryPolicy;
use clip_courier::core::snapshot::JsonFileStore;
use clip_courier::core::stats::StatsAggregator;
use clip_courier::extractor::{
    ExtractError, Extractor, FetchConfig, Fetched, MediaKind, MediaProbe, RequestKind, SearchHit,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type FetchScript =
    Box<dyn Fn(u32, &str, RequestKind, &FetchConfig) -> Result<Fetched, ExtractError> + Send + Sync>;

/// Extractor whose behavior is a closure over the call number
struct ScriptedExtractor {
    calls: AtomicU32,
    script: FetchScript,
}

impl ScriptedExtractor {
    fn new(script: FetchScript) -> Self {
        Self {
            calls: AtomicU32::new(0),
            script,
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for ScriptedExtractor {
    fn fetch(
        &self,
        url: &str,
        kind: RequestKind,
        config: &FetchConfig,
    ) -> Result<Fetched, ExtractError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(call, url, kind, config)
    }

    fn probe(&self, _url: &str, _config: &FetchConfig) -> Result<MediaProbe, ExtractError> {
        Err(ExtractError::Other("probe not scripted".to_string()))
    }

    fn search(
        &self,
        query: &str,
        limit: usize,
        _config: &FetchConfig,
    ) -> Result<Vec<SearchHit>, ExtractError> {
        Ok((0..limit.min(2))
            .map(|i| SearchHit {
                id: format!("id{i}"),
                title: format!("{query} #{i}"),
                url: format!("https://www.youtube.com/watch?v=id{i}"),
                duration_secs: Some(120),
                channel: "channel".to_string(),
            })
            .collect())
    }
}

/// Delivery that records what was sent and whether the file existed then
struct RecordingDelivery {
    sends: Mutex<Vec<(PathBuf, String, MediaKind, bool)>>,
}

impl RecordingDelivery {
    fn new() -> Self {
        Self {
            sends: Mutex::new(Vec::new()),
        }
    }

    fn sends(&self) -> Vec<(PathBuf, String, MediaKind, bool)> {
        self.sends.lock().expect("sends lock").clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn send(&self, path: &Path, caption: &str, kind: MediaKind) -> anyhow::Result<()> {
        self.sends.lock().expect("sends lock").push((
            path.to_path_buf(),
            caption.to_string(),
            kind,
            path.exists(),
        ));
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    downloads: PathBuf,
    _dir: tempfile::TempDir,
}

async fn harness(extractor: Arc<dyn Extractor>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&downloads).expect("downloads dir");

    let mut config = OrchestratorConfig::new(downloads.clone(), None);
    config.duplicate_window = Duration::from_millis(400);
    config.policy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::ZERO,
    };
    config.quick_deadline = Duration::from_millis(400);
    config.media_deadline = Duration::from_millis(400);
    config.worker_slots = 4;

    let store = JsonFileStore::new(dir.path().join("stats.json"));
    let stats = Arc::new(StatsAggregator::load(Box::new(store)).await);
    let orchestrator = Arc::new(Orchestrator::new(config, extractor, stats));

    Harness {
        orchestrator,
        downloads,
        _dir: dir,
    }
}

fn write_media(dir: &Path, name: &str, len: u64) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("create media file");
    file.set_len(len).expect("size media file");
    path
}

fn downloads_left(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| entries.count())
}

fn request(kind: RequestKind, target: &str) -> JobRequest {
    JobRequest {
        user_id: 100,
        kind,
        target: target.to_string(),
    }
}

// Scenario A: an identical request resubmitted within the suppression
// window is rejected as a duplicate, whatever happened to the first one.
#[tokio::test]
async fn duplicate_submission_within_window_is_rejected() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, _, config| {
        let path = config.download_dir.join("a.mp3");
        std::fs::write(&path, b"audio").expect("write");
        Ok(Fetched {
            path,
            title: "song".to_string(),
        })
    })));
    let h = harness(extractor).await;
    let delivery = Arc::new(RecordingDelivery::new());

    let first = h
        .orchestrator
        .submit(request(RequestKind::Audio, "https://x/1"), delivery.clone())
        .await;
    assert!(first.is_ok());

    let second = h
        .orchestrator
        .submit(request(RequestKind::Audio, "https://x/1"), delivery.clone())
        .await;
    assert!(matches!(second, Err(JobError::DuplicateRequest)));

    let outcome = first.expect("handle").outcome().await;
    assert!(matches!(outcome, JobOutcome::Delivered { .. }));
}

// Scenario B: a zero-byte file is rejected, the failure is counted, and
// nothing is left on disk.
#[tokio::test]
async fn empty_file_is_rejected_and_removed() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, _, config| {
        let path = write_media(&config.download_dir, "empty.jpg", 0);
        Ok(Fetched {
            path,
            title: "pic".to_string(),
        })
    })));
    let h = harness(extractor).await;
    let delivery = Arc::new(RecordingDelivery::new());

    let handle = h
        .orchestrator
        .submit(request(RequestKind::Image, "https://x/pic"), delivery.clone())
        .await
        .expect("admitted");

    assert_eq!(handle.outcome().await, JobOutcome::Failed(JobError::FileEmpty));

    let stats = h.orchestrator.stats_snapshot().await;
    assert_eq!(stats.failed_downloads, 1);
    assert_eq!(stats.total_downloads, 0);
    assert!(delivery.sends().is_empty());
    assert_eq!(downloads_left(&h.downloads), 0);
}

// Scenario C: an auth-class failure followed by a relaxed-config success
// delivers the file with exactly two underlying calls.
#[tokio::test]
async fn auth_fallback_succeeds_with_two_calls() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|call, _, _, config| {
        if call == 1 {
            assert!(config.player_hints);
            Err(ExtractError::AuthRequired(
                "Sign in to confirm you're not a bot".to_string(),
            ))
        } else {
            assert!(!config.player_hints);
            let path = config.download_dir.join("clip.mp4");
            std::fs::write(&path, b"video bytes").expect("write");
            Ok(Fetched {
                path,
                title: "the clip".to_string(),
            })
        }
    })));
    let h = harness(extractor.clone()).await;
    let delivery = Arc::new(RecordingDelivery::new());

    let handle = h
        .orchestrator
        .submit(request(RequestKind::Video, "https://x/v"), delivery.clone())
        .await
        .expect("admitted");

    assert_eq!(
        handle.outcome().await,
        JobOutcome::Delivered {
            title: "the clip".to_string()
        }
    );
    assert_eq!(extractor.call_count(), 2);

    let sends = delivery.sends();
    assert_eq!(sends.len(), 1);
    assert!(sends[0].3, "file must exist at delivery time");
    assert_eq!(sends[0].2, MediaKind::Video);

    let stats = h.orchestrator.stats_snapshot().await;
    assert_eq!(stats.total_downloads, 1);
    assert_eq!(stats.downloads_by_kind.video, 1);
    assert_eq!(stats.total_downloads, stats.downloads_by_kind.total());
    assert_eq!(downloads_left(&h.downloads), 0);
}

// Scenario D: an oversized video is rejected, not counted as a download,
// and removed.
#[tokio::test]
async fn oversized_video_is_rejected_and_removed() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, _, config| {
        let path = write_media(&config.download_dir, "big.mp4", 51 * 1024 * 1024);
        Ok(Fetched {
            path,
            title: "big".to_string(),
        })
    })));
    let h = harness(extractor).await;
    let delivery = Arc::new(RecordingDelivery::new());

    let handle = h
        .orchestrator
        .submit(request(RequestKind::Video, "https://x/big"), delivery.clone())
        .await
        .expect("admitted");

    match handle.outcome().await {
        JobOutcome::Failed(JobError::FileTooLarge { limit_mib, .. }) => {
            assert_eq!(limit_mib, 50);
        }
        other => panic!("expected FileTooLarge, got {other:?}"),
    }

    let stats = h.orchestrator.stats_snapshot().await;
    assert_eq!(stats.total_downloads, 0);
    assert_eq!(stats.failed_downloads, 1);
    assert!(delivery.sends().is_empty());
    assert_eq!(downloads_left(&h.downloads), 0);
}

// Scenario E: a deadline overrun reports TimedOut, still releases the gate
// token, and the late file is discarded.
#[tokio::test]
async fn timed_out_job_releases_gate_and_discards_late_file() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, _, config| {
        std::thread::sleep(Duration::from_millis(700));
        let path = config.download_dir.join("late.mp4");
        std::fs::write(&path, b"too late").expect("write");
        Ok(Fetched {
            path,
            title: "late".to_string(),
        })
    })));
    let h = harness(extractor).await;
    let delivery = Arc::new(RecordingDelivery::new());

    let handle = h
        .orchestrator
        .submit(request(RequestKind::Video, "https://x/slow"), delivery.clone())
        .await
        .expect("admitted");

    assert_eq!(handle.outcome().await, JobOutcome::TimedOut);
    assert_eq!(h.orchestrator.in_flight_count().await, 0);

    let stats = h.orchestrator.stats_snapshot().await;
    assert_eq!(stats.failed_downloads, 1);
    assert!(delivery.sends().is_empty());

    // The worker finishes in the background and its file must be reaped
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(downloads_left(&h.downloads), 0);
}

// While a job is running past the suppression window, an identical
// submission is rejected as busy, never run twice.
#[tokio::test]
async fn in_flight_job_blocks_identical_submission() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, _, config| {
        std::thread::sleep(Duration::from_millis(200));
        let path = config.download_dir.join("slowish.mp4");
        std::fs::write(&path, b"bytes").expect("write");
        Ok(Fetched {
            path,
            title: "slowish".to_string(),
        })
    })));
    let h = harness(extractor.clone()).await;
    let delivery = Arc::new(RecordingDelivery::new());

    // Shrink the duplicate window out of the way so the in-flight set is
    // what rejects the resubmission
    let mut config = OrchestratorConfig::new(h.downloads.clone(), None);
    config.duplicate_window = Duration::from_millis(1);
    config.policy = RetryPolicy {
        max_attempts: 1,
        delay: Duration::ZERO,
    };
    config.media_deadline = Duration::from_millis(800);
    let store = JsonFileStore::new(h.downloads.join("stats2.json"));
    let stats = Arc::new(StatsAggregator::load(Box::new(store)).await);
    let orchestrator = Arc::new(Orchestrator::new(config, extractor, stats));

    let first = orchestrator
        .submit(request(RequestKind::Video, "https://x/v"), delivery.clone())
        .await;
    assert!(first.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = orchestrator
        .submit(request(RequestKind::Video, "https://x/v"), delivery.clone())
        .await;
    assert!(matches!(second, Err(JobError::Busy)));

    // A different target from the same user runs in parallel just fine
    let other = orchestrator
        .submit(request(RequestKind::Video, "https://x/other"), delivery.clone())
        .await;
    assert!(other.is_ok());

    let _ = first.expect("handle").outcome().await;
    let _ = other.expect("handle").outcome().await;
    assert_eq!(orchestrator.in_flight_count().await, 0);
}

// Search goes through the same gate and lands in the statistics.
#[tokio::test]
async fn search_is_gated_and_counted() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, _, _| {
        Err(ExtractError::Other("fetch not used here".to_string()))
    })));
    let h = harness(extractor).await;

    let hits = h
        .orchestrator
        .search(100, "test song")
        .await
        .expect("results");
    assert_eq!(hits.len(), 2);

    let again = h.orchestrator.search(100, "test song").await;
    assert!(matches!(again, Err(JobError::DuplicateRequest)));

    let stats = h.orchestrator.stats_snapshot().await;
    assert_eq!(stats.total_searches, 1);
    assert_eq!(stats.search_terms.get("test song"), Some(&1));
    assert_eq!(h.orchestrator.in_flight_count().await, 0);
}

// A story resolves its media kind (and statistics bucket) from the file
// the platform actually served.
#[tokio::test]
async fn story_kind_resolved_from_produced_file() {
    let extractor = Arc::new(ScriptedExtractor::new(Box::new(|_, _, kind, config| {
        assert_eq!(kind, RequestKind::Story);
        let path = config.download_dir.join("frame.jpg");
        std::fs::write(&path, b"jpeg bytes").expect("write");
        Ok(Fetched {
            path,
            title: "Story by someone".to_string(),
        })
    })));
    let h = harness(extractor).await;
    let delivery = Arc::new(RecordingDelivery::new());

    let handle = h
        .orchestrator
        .submit(
            request(RequestKind::Story, "https://instagram.com/stories/someone/1/"),
            delivery.clone(),
        )
        .await
        .expect("admitted");

    assert!(matches!(handle.outcome().await, JobOutcome::Delivered { .. }));

    let sends = delivery.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].2, MediaKind::Image);

    let stats = h.orchestrator.stats_snapshot().await;
    assert_eq!(stats.downloads_by_kind.image, 1);
    assert_eq!(stats.downloads_by_kind.video, 0);
    assert_eq!(downloads_left(&h.downloads), 0);
}
