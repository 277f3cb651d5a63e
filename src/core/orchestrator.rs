//! The job pipeline: gate, offload, retry, deadline, finalize, deliver,
//! record, release.
//!
//! One lightweight task per admitted request; the blocking extractor call
//! runs on a semaphore-bounded worker pool. For a given (user, action key)
//! at most one job is ever in flight, while different keys run fully in
//! parallel up to the pool size. The gate token is released on every exit
//! path, after the terminal outcome has been recorded.

use crate::core::error::JobError;
use crate::core::gate::{ActionGate, Admission};
use crate::core::lifecycle::{self, Delivery};
use crate::core::retry::{self, RetryPolicy};
use crate::core::stats::{platform_from_url, DownloadKind, StatsAggregator, StatsSnapshot};
use crate::core::timeout::{self, DeadlineOutcome};
use crate::extractor::{Extractor, FetchConfig, MediaKind, MediaProbe, RequestKind, SearchHit};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tuning for the orchestrator, defaulting to the values in `config.rs`
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory downloads are written into
    pub download_dir: PathBuf,
    /// Optional cookies file handed to the extractor
    pub cookies_file: Option<PathBuf>,
    /// Duplicate-suppression window
    pub duplicate_window: Duration,
    /// Retry tuning
    pub policy: RetryPolicy,
    /// Parallel extractor slots
    pub worker_slots: usize,
    /// Deadline for search / metadata / image jobs
    pub quick_deadline: Duration,
    /// Deadline for video / audio / story jobs
    pub media_deadline: Duration,
}

impl OrchestratorConfig {
    /// Defaults from `config.rs`, rooted at the given download directory
    #[must_use]
    pub fn new(download_dir: PathBuf, cookies_file: Option<PathBuf>) -> Self {
        Self {
            download_dir,
            cookies_file,
            duplicate_window: Duration::from_secs(crate::config::DUPLICATE_WINDOW_SECS),
            policy: RetryPolicy::default(),
            worker_slots: 4,
            quick_deadline: Duration::from_secs(crate::config::QUICK_JOB_DEADLINE_SECS),
            media_deadline: Duration::from_secs(crate::config::MEDIA_JOB_DEADLINE_SECS),
        }
    }

    fn deadline_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Image => self.quick_deadline,
            _ => self.media_deadline,
        }
    }
}

/// One download request
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Requesting user
    pub user_id: i64,
    /// What they asked for
    pub kind: RequestKind,
    /// Target URL
    pub target: String,
}

/// Terminal result of one admitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// File validated, sent and cleaned up
    Delivered {
        /// Title of the delivered content
        title: String,
    },
    /// The job failed; the reason's display text is the status message
    Failed(JobError),
    /// The deadline elapsed; background work, if any, is discarded
    TimedOut,
}

/// Handle to a running job
pub struct JobHandle {
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// Wait for the job's terminal outcome
    pub async fn outcome(self) -> JobOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Failed(JobError::Internal(format!("job task failed: {e}"))),
        }
    }
}

/// The orchestration core. The bot front-end talks only to this.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    gate: ActionGate,
    stats: Arc<StatsAggregator>,
    extractor: Arc<dyn Extractor>,
    workers: Arc<Semaphore>,
}

impl Orchestrator {
    /// Wire the core together
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        extractor: Arc<dyn Extractor>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        let gate = ActionGate::new(
            config.duplicate_window,
            crate::config::RECENT_ACTION_CACHE_CAPACITY,
        );
        let workers = Arc::new(Semaphore::new(config.worker_slots));
        Self {
            inner: Arc::new(Inner {
                config,
                gate,
                stats,
                extractor,
                workers,
            }),
        }
    }

    /// Statistics owner, shared with reporting
    #[must_use]
    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.inner.stats
    }

    /// Read-only copy of the aggregate statistics
    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot().await
    }

    /// All known user ids for admin broadcast fan-out
    pub async fn broadcast_targets(&self) -> Vec<i64> {
        self.inner.stats.broadcast_targets().await
    }

    /// Jobs currently holding a gate token (monitoring)
    pub async fn in_flight_count(&self) -> usize {
        self.inner.gate.in_flight_count().await
    }

    /// Submit a download job.
    ///
    /// Admission is decided here; the work itself runs on its own task and
    /// is observed through the returned [`JobHandle`].
    ///
    /// # Errors
    ///
    /// `DuplicateRequest` or `Busy` when the gate rejects the request.
    pub async fn submit(
        &self,
        request: JobRequest,
        delivery: Arc<dyn Delivery>,
    ) -> Result<JobHandle, JobError> {
        let action_key = request.kind.action_key(&request.target);
        match self.inner.gate.admit(request.user_id, &action_key).await {
            Admission::Admitted => {}
            Admission::DuplicateRejected => return Err(JobError::DuplicateRequest),
            Admission::BusyRejected => return Err(JobError::Busy),
        }

        self.inner.stats.record_usage(request.user_id).await;
        info!(
            user_id = request.user_id,
            kind = request.kind.label(),
            target = %request.target,
            "job admitted"
        );

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let (outcome, stat_kind) = inner.execute(&request, delivery).await;
            inner.record_outcome(&request, &outcome, stat_kind).await;
            inner.gate.release(request.user_id, &action_key).await;
            outcome
        });

        Ok(JobHandle { task })
    }

    /// Gated, deadline-bounded search (no file lifecycle involved)
    ///
    /// # Errors
    ///
    /// Gate rejections, `TimedOut`, or the classified extractor failure.
    pub async fn search(&self, user_id: i64, query: &str) -> Result<Vec<SearchHit>, JobError> {
        let action_key = format!("search:{query}");
        match self.inner.gate.admit(user_id, &action_key).await {
            Admission::Admitted => {}
            Admission::DuplicateRejected => return Err(JobError::DuplicateRequest),
            Admission::BusyRejected => return Err(JobError::Busy),
        }

        self.inner.stats.record_search(user_id, query).await;

        let extractor = Arc::clone(&self.inner.extractor);
        let query_owned = query.to_string();
        let cancel = CancellationToken::new();
        let config = self.inner.fetch_config(cancel.clone());
        let result = self
            .inner
            .run_quick(cancel, move || {
                extractor
                    .search(&query_owned, crate::config::SEARCH_RESULT_LIMIT, &config)
                    .map_err(classify_extract_error)
            })
            .await;

        self.inner.gate.release(user_id, &action_key).await;
        result
    }

    /// Gated, deadline-bounded metadata probe
    ///
    /// # Errors
    ///
    /// Gate rejections, `TimedOut`, or the classified extractor failure.
    pub async fn inspect(&self, user_id: i64, url: &str) -> Result<MediaProbe, JobError> {
        let action_key = format!("info:{url}");
        match self.inner.gate.admit(user_id, &action_key).await {
            Admission::Admitted => {}
            Admission::DuplicateRejected => return Err(JobError::DuplicateRequest),
            Admission::BusyRejected => return Err(JobError::Busy),
        }

        self.inner.stats.record_usage(user_id).await;

        let extractor = Arc::clone(&self.inner.extractor);
        let url_owned = url.to_string();
        let cancel = CancellationToken::new();
        let config = self.inner.fetch_config(cancel.clone());
        let result = self
            .inner
            .run_quick(cancel, move || {
                extractor
                    .probe(&url_owned, &config)
                    .map_err(classify_extract_error)
            })
            .await;

        self.inner.gate.release(user_id, &action_key).await;
        result
    }
}

impl Inner {
    async fn record_outcome(
        &self,
        request: &JobRequest,
        outcome: &JobOutcome,
        stat_kind: DownloadKind,
    ) {
        match outcome {
            JobOutcome::Delivered { title } => {
                info!(user_id = request.user_id, title = %title, "job delivered");
                self.stats
                    .record_download(request.user_id, stat_kind, platform_from_url(&request.target))
                    .await;
            }
            JobOutcome::Failed(err) => {
                warn!(user_id = request.user_id, error = %err, "job failed");
                self.stats.record_failure(request.user_id).await;
            }
            JobOutcome::TimedOut => {
                warn!(user_id = request.user_id, "job timed out");
                self.stats.record_failure(request.user_id).await;
            }
        }
    }

    async fn run_quick<T, F>(&self, cancel: CancellationToken, work: F) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(JobError::Internal("worker pool closed".to_string())),
        };

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        });

        match timeout::bound_task(self.config.quick_deadline, cancel, task, |_| {}).await {
            DeadlineOutcome::Finished(Ok(result)) => result,
            DeadlineOutcome::Finished(Err(e)) => {
                Err(JobError::Internal(format!("worker task failed: {e}")))
            }
            DeadlineOutcome::TimedOut => Err(JobError::TimedOut),
        }
    }

    fn fetch_config(&self, cancel: CancellationToken) -> FetchConfig {
        FetchConfig::new(
            self.config.download_dir.clone(),
            self.config.cookies_file.clone(),
        )
        .with_cancel(cancel)
    }

    async fn execute(
        &self,
        request: &JobRequest,
        delivery: Arc<dyn Delivery>,
    ) -> (JobOutcome, DownloadKind) {
        let fallback_kind = stat_kind_for(request.kind, request.kind.media());

        // Offload the blocking fetch (with its retry loop) to the pool
        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return (
                    JobOutcome::Failed(JobError::Internal("worker pool closed".to_string())),
                    fallback_kind,
                );
            }
        };

        let cancel = CancellationToken::new();
        let config = self.fetch_config(cancel.clone());
        let extractor = Arc::clone(&self.extractor);
        let policy = self.config.policy.clone();
        let (kind, target) = (request.kind, request.target.clone());

        let fetch_task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            retry::run(extractor.as_ref(), &target, kind, &config, &policy)
        });

        // A worker that outlives the deadline keeps running; whatever file
        // it eventually produces is removed by the discard hook
        let deadline = self.config.deadline_for(request.kind);
        let fetched = match timeout::bound_task(deadline, cancel, fetch_task, |late| {
            if let Ok(fetched) = late {
                let _ = std::fs::remove_file(&fetched.path);
            }
        })
        .await
        {
            DeadlineOutcome::Finished(Ok(Ok(fetched))) => fetched,
            DeadlineOutcome::Finished(Ok(Err(job_err))) => {
                return (JobOutcome::Failed(job_err), fallback_kind);
            }
            DeadlineOutcome::Finished(Err(e)) => {
                return (
                    JobOutcome::Failed(JobError::Internal(format!("worker task failed: {e}"))),
                    fallback_kind,
                );
            }
            DeadlineOutcome::TimedOut => return (JobOutcome::TimedOut, fallback_kind),
        };

        // Stories resolve their file class only now, from the actual file
        let media = request
            .kind
            .media()
            .unwrap_or_else(|| MediaKind::from_path(&fetched.path));
        let stat_kind = stat_kind_for(request.kind, Some(media));

        let deliverable = match lifecycle::finalize(fetched.path, media) {
            Ok(deliverable) => deliverable,
            Err(err) => return (JobOutcome::Failed(err), stat_kind),
        };

        match lifecycle::deliver(deliverable, delivery.as_ref(), &fetched.title).await {
            Ok(()) => (
                JobOutcome::Delivered {
                    title: fetched.title,
                },
                stat_kind,
            ),
            Err(err) => (JobOutcome::Failed(err), stat_kind),
        }
    }
}

const fn stat_kind_for(kind: RequestKind, media: Option<MediaKind>) -> DownloadKind {
    match kind {
        RequestKind::Image => DownloadKind::Image,
        RequestKind::Video => DownloadKind::Video,
        RequestKind::Audio => DownloadKind::Audio,
        RequestKind::Song => DownloadKind::Search,
        RequestKind::Story => match media {
            Some(MediaKind::Video) => DownloadKind::Video,
            _ => DownloadKind::Image,
        },
    }
}

fn classify_extract_error(err: crate::extractor::ExtractError) -> JobError {
    use crate::extractor::ExtractError;
    match err {
        ExtractError::AuthRequired(_) => JobError::AuthRequired,
        ExtractError::Unsupported(msg) | ExtractError::ToolMissing(msg) => {
            JobError::Unsupported(msg)
        }
        ExtractError::Network(msg) | ExtractError::Other(msg) => JobError::TransientFailure {
            attempts: 1,
            cause: msg,
        },
    }
}
