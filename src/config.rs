//! Configuration and settings management
//!
//! Loads settings from environment variables and defines the tuning knobs for
//! the orchestration core (windows, deadlines, ceilings, retry policy).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Channel users must be subscribed to before using the bot (without `@`)
    #[serde(default)]
    pub required_channel: Option<String>,

    /// Invite link shown together with the subscription prompt
    #[serde(default)]
    pub channel_link: Option<String>,

    /// Telegram ID of the developer (enables /stats and /broadcast)
    #[serde(default)]
    pub developer_id: Option<i64>,

    /// Directory for temporary downloads
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Path of the persisted statistics snapshot
    #[serde(default = "default_stats_file")]
    pub stats_file: String,

    /// Optional cookies file handed through to yt-dlp
    #[serde(default)]
    pub cookies_file: Option<String>,

    /// Number of parallel extractor worker slots
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
}

fn default_download_dir() -> String {
    "downloads".to_string()
}

fn default_stats_file() -> String {
    "bot_stats.json".to_string()
}

const fn default_worker_slots() -> usize {
    4
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case;
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }
}

// Request gating
/// Sliding window for duplicate-request suppression
pub const DUPLICATE_WINDOW_SECS: u64 = 12;
/// Max entries in the recent-action cache
pub const RECENT_ACTION_CACHE_CAPACITY: u64 = 10_000;

// Retry policy against the extractor
/// Maximum download attempts per job
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
/// Fixed delay between attempts
pub const RETRY_DELAY_SECS: u64 = 2;

// Job deadlines
/// Wall-clock deadline for search / metadata / image jobs
pub const QUICK_JOB_DEADLINE_SECS: u64 = 30;
/// Wall-clock deadline for video / audio / story jobs
pub const MEDIA_JOB_DEADLINE_SECS: u64 = 60;

// File size ceilings by media kind
/// Largest image the bot will deliver
pub const IMAGE_SIZE_CEILING: u64 = 10 * 1024 * 1024;
/// Largest video the bot will deliver (Telegram bot API bound)
pub const VIDEO_SIZE_CEILING: u64 = 50 * 1024 * 1024;
/// Largest audio file the bot will deliver
pub const AUDIO_SIZE_CEILING: u64 = 50 * 1024 * 1024;

// Song search
/// Number of results fetched per search
pub const SEARCH_RESULT_LIMIT: usize = 5;
/// How long cached search results stay selectable
pub const SEARCH_CACHE_TTL_SECS: u64 = 600;
/// Max users with live search results
pub const SEARCH_CACHE_CAPACITY: u64 = 10_000;

// Telegram API retry (delivery resilience)
/// Max retries for one Telegram API operation
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff for Telegram API retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff cap for Telegram API retries
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;

// Reporting
/// Leaderboard length in the /stats report
pub const LEADERBOARD_SIZE: usize = 5;
