//! Media extraction capability.
//!
//! The orchestration core never parses sites itself; it invokes an
//! [`Extractor`] implementation through this trait. Extractor calls are
//! blocking by contract and are expected to run on a worker thread
//! ([`tokio::task::spawn_blocking`]), never on the async scheduler.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// yt-dlp backed implementation
pub mod ytdlp;

/// Classified extraction failures.
///
/// The extractor pre-classifies its errors so the retry executor can decide
/// between retrying, relaxing the configuration, or failing fast without
/// string-matching on its own.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Transient network condition, worth retrying
    #[error("network error: {0}")]
    Network(String),
    /// The platform demands sign-in / bot verification
    #[error("authentication required: {0}")]
    AuthRequired(String),
    /// The target is gone, private, or the URL is not extractable
    #[error("unsupported target: {0}")]
    Unsupported(String),
    /// A required external tool (yt-dlp, ffmpeg) is unavailable
    #[error("required tool missing: {0}")]
    ToolMissing(String),
    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// File class of a produced download, drives size ceilings and the
/// delivery method (photo / video / audio message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Still image
    Image,
    /// Video file
    Video,
    /// Audio file
    Audio,
}

impl MediaKind {
    /// Size ceiling in bytes for this kind of file
    #[must_use]
    pub const fn size_ceiling(self) -> u64 {
        match self {
            Self::Image => crate::config::IMAGE_SIZE_CEILING,
            Self::Video => crate::config::VIDEO_SIZE_CEILING,
            Self::Audio => crate::config::AUDIO_SIZE_CEILING,
        }
    }

    /// Resolve the media kind from a produced file's extension.
    ///
    /// Used for story downloads, where the platform decides whether the
    /// story frame is a clip or a picture.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("mp4" | "mov" | "webm" | "mkv") => Self::Video,
            Some("mp3" | "m4a" | "opus" | "ogg" | "wav") => Self::Audio,
            _ => Self::Image,
        }
    }
}

/// What the user asked for. Distinct from [`MediaKind`]: a story's file
/// class is only known after the fetch, and a song picked from search
/// results is fetched as audio but counted separately in statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Direct or scraped image link
    Image,
    /// Video download
    Video,
    /// Audio-only download
    Audio,
    /// Instagram story (image or clip, resolved after fetch)
    Story,
    /// Song picked from YouTube search results
    Song,
}

impl RequestKind {
    /// Stable key identifying the semantic request, used for duplicate
    /// suppression and mutual exclusion.
    #[must_use]
    pub fn action_key(self, target: &str) -> String {
        format!("{}:{target}", self.label())
    }

    /// Short lowercase label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Story => "story",
            Self::Song => "song",
        }
    }

    /// Expected file class, if it is known before the fetch
    #[must_use]
    pub const fn media(self) -> Option<MediaKind> {
        match self {
            Self::Image => Some(MediaKind::Image),
            Self::Video => Some(MediaKind::Video),
            Self::Audio | Self::Song => Some(MediaKind::Audio),
            Self::Story => None,
        }
    }
}

/// A successfully produced download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Where the file landed
    pub path: PathBuf,
    /// Human-readable title for the caption
    pub title: String,
}

/// Metadata probe result for the /info view
#[derive(Debug, Clone)]
pub struct MediaProbe {
    /// Content title
    pub title: String,
    /// Channel / uploader / creator
    pub uploader: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u64>,
    /// View count, if known
    pub view_count: Option<u64>,
    /// Like count, if known
    pub like_count: Option<u64>,
}

/// One search result
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Platform video id
    pub id: String,
    /// Video title
    pub title: String,
    /// Watch URL
    pub url: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u64>,
    /// Channel name
    pub channel: String,
}

/// Browser signatures rotated between attempts to look less like a bot.
/// Cosmetic: which one is active carries no semantics.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

static NEXT_IDENTITY: AtomicUsize = AtomicUsize::new(0);

/// Per-job extraction configuration.
///
/// `relaxed()` produces the reduced configuration used for the one
/// authentication fallback retry: extractor-specific player hints are
/// dropped and format negotiation falls back to whatever is available.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Directory downloads are written into
    pub download_dir: PathBuf,
    /// Optional cookies file handed to the extractor
    pub cookies_file: Option<PathBuf>,
    /// Pass platform-specific player hints (player_client etc.)
    pub player_hints: bool,
    /// Insist on the preferred container/format chain
    pub strict_formats: bool,
    /// Active browser signature
    pub user_agent: &'static str,
    /// Cooperative cancellation signal; extractors that can stop early
    /// should honor it, the guard does not rely on it
    pub cancel: CancellationToken,
}

impl FetchConfig {
    /// Build the default (strict) configuration
    #[must_use]
    pub fn new(download_dir: PathBuf, cookies_file: Option<PathBuf>) -> Self {
        Self {
            download_dir,
            cookies_file,
            player_hints: true,
            strict_formats: true,
            user_agent: USER_AGENTS[0],
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The reduced configuration for the authentication fallback retry
    #[must_use]
    pub fn relaxed(mut self) -> Self {
        self.player_hints = false;
        self.strict_formats = false;
        self
    }

    /// Rotate to the next browser signature
    pub fn rotate_identity(&mut self) {
        let idx = NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed);
        self.user_agent = USER_AGENTS[idx % USER_AGENTS.len()];
    }
}

/// External capability that turns a reference URL into a media file.
///
/// All methods block the calling thread; callers offload them to the
/// bounded worker pool.
#[cfg_attr(test, mockall::automock)]
pub trait Extractor: Send + Sync {
    /// Fetch the target and produce a file plus its title
    ///
    /// # Errors
    ///
    /// Returns a classified [`ExtractError`] on failure.
    fn fetch(
        &self,
        url: &str,
        kind: RequestKind,
        config: &FetchConfig,
    ) -> Result<Fetched, ExtractError>;

    /// Probe the target's metadata without downloading
    ///
    /// # Errors
    ///
    /// Returns a classified [`ExtractError`] on failure.
    fn probe(&self, url: &str, config: &FetchConfig) -> Result<MediaProbe, ExtractError>;

    /// Search the platform for up to `limit` results
    ///
    /// # Errors
    ///
    /// Returns a classified [`ExtractError`] on failure.
    fn search(
        &self,
        query: &str,
        limit: usize,
        config: &FetchConfig,
    ) -> Result<Vec<SearchHit>, ExtractError>;
}
