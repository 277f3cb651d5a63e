//! yt-dlp backed extractor.
//!
//! Media downloads, metadata probes and YouTube search all shell out to the
//! `yt-dlp` binary; direct image links and public image pages go through a
//! plain HTTP fetch instead, since yt-dlp has nothing to offer there. Every
//! operation blocks the calling thread and is run on the worker pool by the
//! orchestrator.

use super::{
    ExtractError, Extractor, FetchConfig, Fetched, MediaProbe, RequestKind, SearchHit,
};
use lazy_regex::{lazy_regex, Lazy};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stderr patterns meaning the platform demands sign-in / bot verification
const AUTH_ERROR_PATTERNS: &[&str] = &[
    "Sign in to confirm",
    "confirm you're not a bot",
    "use --cookies",
    "cookies",
    "Login required",
    "This video is private",
    "Private video",
];

/// Stderr patterns meaning the target itself is a dead end; retrying or
/// relaxing the configuration will not help
const FATAL_ERROR_PATTERNS: &[&str] = &[
    "Unsupported URL",
    "is not a valid URL",
    "Video unavailable",
    "This video is not available",
    "removed by the uploader",
    "no longer available",
    "blocked it in your country",
    "geo-restricted",
    "copyright",
    "terminated account",
    "Unable to extract video data",
    "HTTP Error 404",
    "members-only",
    "Join this channel",
];

/// Stderr patterns worth another attempt
const RETRYABLE_ERROR_PATTERNS: &[&str] = &[
    "Connection reset",
    "Connection timed out",
    "Read timed out",
    "Unable to download webpage",
    "HTTP Error 429",
    "HTTP Error 503",
    "network is unreachable",
    "Temporary failure in name resolution",
];

static RE_STORY_USERNAME: Lazy<regex::Regex> = lazy_regex!(r"instagram\.com/stories/([^/?]+)");

/// Patterns an image URL may hide behind in a scraped page, checked in order
static RE_IMAGE_SOURCES: &[&Lazy<regex::Regex>] = &[
    &RE_DISPLAY_URL,
    &RE_OG_IMAGE,
    &RE_CONTENT_URL,
    &RE_IMG_TAG,
];

static RE_DISPLAY_URL: Lazy<regex::Regex> = lazy_regex!(r#""display_url":"(https://[^"]+)""#);
static RE_OG_IMAGE: Lazy<regex::Regex> = lazy_regex!(r#"property="og:image" content="([^"]+)""#);
static RE_CONTENT_URL: Lazy<regex::Regex> = lazy_regex!(r#""contentUrl":"(https://[^"]+)""#);
static RE_IMG_TAG: Lazy<regex::Regex> = lazy_regex!(r#"<img[^>]+src="([^"]+)""#);

fn classify_failure(stderr: &str) -> ExtractError {
    if AUTH_ERROR_PATTERNS.iter().any(|p| stderr.contains(p)) {
        return ExtractError::AuthRequired(first_line(stderr));
    }
    if FATAL_ERROR_PATTERNS.iter().any(|p| stderr.contains(p)) {
        return ExtractError::Unsupported(first_line(stderr));
    }
    if stderr.contains("ffmpeg") || stderr.contains("ffprobe") {
        return ExtractError::ToolMissing(first_line(stderr));
    }
    if RETRYABLE_ERROR_PATTERNS.iter().any(|p| stderr.contains(p)) {
        return ExtractError::Network(first_line(stderr));
    }
    ExtractError::Other(first_line(stderr))
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown error")
        .trim()
        .to_string()
}

/// Extractor backed by the yt-dlp binary plus a plain HTTP client
pub struct YtDlpExtractor {
    binary: PathBuf,
    ffmpeg_dir: Option<PathBuf>,
    http: OnceLock<reqwest::blocking::Client>,
}

impl YtDlpExtractor {
    /// Use explicit tool locations
    #[must_use]
    pub fn new(binary: PathBuf, ffmpeg: Option<PathBuf>) -> Self {
        Self {
            binary,
            ffmpeg_dir: ffmpeg.and_then(|p| p.parent().map(Path::to_path_buf)),
            http: OnceLock::new(),
        }
    }

    /// Locate yt-dlp (and, best effort, ffmpeg) on the system
    ///
    /// # Errors
    ///
    /// `ToolMissing` when no yt-dlp binary can be found.
    pub fn discover() -> Result<Self, ExtractError> {
        let binary = which::which("yt-dlp")
            .map_err(|_| ExtractError::ToolMissing("yt-dlp not found in PATH".to_string()))?;
        let ffmpeg = locate_ffmpeg();
        match &ffmpeg {
            Some(path) => info!(path = %path.display(), "ffmpeg found"),
            None => warn!("ffmpeg not found, audio will keep its original container"),
        }
        Ok(Self::new(binary, ffmpeg))
    }

    const fn has_ffmpeg(&self) -> bool {
        self.ffmpeg_dir.is_some()
    }

    fn http_client(&self) -> &reqwest::blocking::Client {
        // Built lazily so construction happens on a worker thread, never on
        // the async scheduler
        self.http.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default()
        })
    }

    /// Run yt-dlp and return its stdout. The child is polled so the
    /// cancellation token can kill it mid-download.
    fn run_ytdlp(&self, args: &[String], config: &FetchConfig) -> Result<String, ExtractError> {
        debug!(?args, "running yt-dlp");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExtractError::ToolMissing("yt-dlp binary missing".to_string())
                } else {
                    ExtractError::Other(format!("failed to spawn yt-dlp: {e}"))
                }
            })?;

        // Drain the pipes from their own threads so a chatty download can
        // never fill a pipe and wedge the child
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || read_all(stdout_pipe));
        let stderr_reader = std::thread::spawn(move || read_all(stderr_pipe));

        let status = loop {
            if config.cancel.is_cancelled() {
                warn!("cancellation requested, killing yt-dlp");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExtractError::Other("download cancelled".to_string()));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(Duration::from_millis(150)),
                Err(e) => return Err(ExtractError::Other(format!("wait failed: {e}"))),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            Err(classify_failure(&stderr))
        }
    }

    fn download_args(
        &self,
        url: &str,
        kind: RequestKind,
        stem: &str,
        config: &FetchConfig,
    ) -> Vec<String> {
        let template = config
            .download_dir
            .join(format!("{stem}.%(ext)s"))
            .to_string_lossy()
            .to_string();

        let mut args = vec![
            "-j".to_string(),
            "--no-simulate".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--user-agent".to_string(),
            config.user_agent.to_string(),
            "-o".to_string(),
            template,
        ];

        if let Some(cookies) = &config.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        if let Some(ffmpeg_dir) = &self.ffmpeg_dir {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg_dir.to_string_lossy().to_string());
        }
        if config.player_hints {
            args.push("--extractor-args".to_string());
            args.push("youtube:player_client=android,web".to_string());
        }

        match kind {
            RequestKind::Video => {
                if config.strict_formats {
                    args.push("-f".to_string());
                    args.push("best[ext=mp4]/best[height<=1080]/best".to_string());
                    args.push("--merge-output-format".to_string());
                    args.push("mp4".to_string());
                } else {
                    args.push("-f".to_string());
                    args.push("best".to_string());
                }
            }
            RequestKind::Audio | RequestKind::Song => {
                if self.has_ffmpeg() && config.strict_formats {
                    args.push("-x".to_string());
                    args.push("--audio-format".to_string());
                    args.push("mp3".to_string());
                    args.push("--audio-quality".to_string());
                    args.push("192K".to_string());
                } else {
                    args.push("-f".to_string());
                    args.push("bestaudio[ext=m4a]/bestaudio/best".to_string());
                }
            }
            // Stories take whatever the platform serves
            RequestKind::Story | RequestKind::Image => {}
        }

        args.push(url.to_string());
        args
    }

    fn ytdlp_download(
        &self,
        url: &str,
        kind: RequestKind,
        config: &FetchConfig,
    ) -> Result<Fetched, ExtractError> {
        let stem = Uuid::new_v4().as_simple().to_string();
        let args = self.download_args(url, kind, &stem, config);
        let stdout = self.run_ytdlp(&args, config)?;

        let title = serde_json::from_str::<Value>(stdout.lines().next().unwrap_or(""))
            .ok()
            .and_then(|info| info["title"].as_str().map(str::to_string))
            .unwrap_or_else(|| "media".to_string());

        let path = find_by_stem(&config.download_dir, &stem)
            .ok_or_else(|| ExtractError::Other("download produced no file".to_string()))?;

        Ok(Fetched { path, title })
    }

    fn fetch_story(&self, url: &str, config: &FetchConfig) -> Result<Fetched, ExtractError> {
        let username = RE_STORY_USERNAME
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                ExtractError::Unsupported("not an Instagram story link".to_string())
            })?;

        let fetched = self.ytdlp_download(url, RequestKind::Story, config)?;
        Ok(Fetched {
            path: fetched.path,
            title: format!("Story by {username}"),
        })
    }

    fn fetch_image(&self, url: &str, config: &FetchConfig) -> Result<Fetched, ExtractError> {
        let client = self.http_client();
        let response = client
            .get(url)
            .header(reqwest::header::USER_AGENT, config.user_agent)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let (bytes, final_type, source_url) = if content_type.starts_with("image/") {
            // The link was the image itself
            let bytes = response
                .bytes()
                .map_err(|e| ExtractError::Network(e.to_string()))?
                .to_vec();
            (bytes, content_type, url.to_string())
        } else {
            // A page: scrape it for the best-looking image reference
            let html = response
                .text()
                .map_err(|e| ExtractError::Network(e.to_string()))?;
            let image_url = scrape_image_url(&html).ok_or_else(|| {
                ExtractError::Unsupported("no image found at target".to_string())
            })?;
            let (bytes, image_type) = self.get_bytes(&image_url, config)?;
            (bytes, image_type, image_url)
        };

        let ext = extension_for(&final_type, &source_url);
        let path = config
            .download_dir
            .join(format!("{}.{ext}", Uuid::new_v4().as_simple()));
        std::fs::write(&path, &bytes)
            .map_err(|e| ExtractError::Other(format!("failed to store image: {e}")))?;

        Ok(Fetched {
            path,
            title: format!("Photo from {}", host_of(url)),
        })
    }

    fn get_bytes(
        &self,
        url: &str,
        config: &FetchConfig,
    ) -> Result<(Vec<u8>, String), ExtractError> {
        let response = self
            .http_client()
            .get(url)
            .header(reqwest::header::USER_AGENT, config.user_agent)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| ExtractError::Network(e.to_string()))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let bytes = response
            .bytes()
            .map_err(|e| ExtractError::Network(e.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    }
}

impl Extractor for YtDlpExtractor {
    fn fetch(
        &self,
        url: &str,
        kind: RequestKind,
        config: &FetchConfig,
    ) -> Result<Fetched, ExtractError> {
        match kind {
            RequestKind::Image => self.fetch_image(url, config),
            RequestKind::Story => self.fetch_story(url, config),
            RequestKind::Video | RequestKind::Audio | RequestKind::Song => {
                self.ytdlp_download(url, kind, config)
            }
        }
    }

    fn probe(&self, url: &str, config: &FetchConfig) -> Result<MediaProbe, ExtractError> {
        let mut args = vec![
            "-j".to_string(),
            "--skip-download".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--user-agent".to_string(),
            config.user_agent.to_string(),
        ];
        if let Some(cookies) = &config.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        args.push(url.to_string());

        let stdout = self.run_ytdlp(&args, config)?;
        let info: Value = serde_json::from_str(stdout.lines().next().unwrap_or(""))
            .map_err(|e| ExtractError::Other(format!("unreadable metadata: {e}")))?;

        Ok(MediaProbe {
            title: info["title"].as_str().unwrap_or("unknown").to_string(),
            uploader: info["uploader"]
                .as_str()
                .or_else(|| info["channel"].as_str())
                .or_else(|| info["creator"].as_str())
                .unwrap_or("unknown")
                .to_string(),
            duration_secs: info["duration"].as_u64(),
            view_count: info["view_count"].as_u64(),
            like_count: info["like_count"].as_u64(),
        })
    }

    fn search(
        &self,
        query: &str,
        limit: usize,
        config: &FetchConfig,
    ) -> Result<Vec<SearchHit>, ExtractError> {
        let args = vec![
            "-j".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
            "--user-agent".to_string(),
            config.user_agent.to_string(),
            format!("ytsearch{limit}:{query}"),
        ];

        let stdout = self.run_ytdlp(&args, config)?;
        let hits = stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|entry| {
                let id = entry["id"].as_str()?.to_string();
                Some(SearchHit {
                    url: format!("https://www.youtube.com/watch?v={id}"),
                    title: entry["title"].as_str().unwrap_or("unknown").to_string(),
                    duration_secs: entry["duration"]
                        .as_f64()
                        .map(|d| d.max(0.0).round() as u64),
                    channel: entry["uploader"]
                        .as_str()
                        .or_else(|| entry["channel"].as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                    id,
                })
            })
            .collect();

        Ok(hits)
    }
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

fn locate_ffmpeg() -> Option<PathBuf> {
    let candidates = [
        "/usr/bin/ffmpeg",
        "/usr/local/bin/ffmpeg",
        "/bin/ffmpeg",
    ];
    for candidate in candidates {
        let path = Path::new(candidate);
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    which::which("ffmpeg").ok()
}

fn find_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(stem) && !n.ends_with(".part"))
        })
}

fn scrape_image_url(html: &str) -> Option<String> {
    for pattern in RE_IMAGE_SOURCES {
        for captures in pattern.captures_iter(html) {
            let Some(candidate) = captures.get(1).map(|m| m.as_str()) else {
                continue;
            };
            let lower = candidate.to_lowercase();
            let looks_like_image = [".jpg", ".jpeg", ".png", ".webp"]
                .iter()
                .any(|ext| lower.contains(ext))
                || lower.contains("fbcdn")
                || lower.contains("cdninstagram");
            if looks_like_image {
                return Some(candidate.replace("\\u0026", "&"));
            }
        }
    }
    None
}

fn extension_for(content_type: &str, url: &str) -> &'static str {
    if content_type.contains("jpeg") || content_type.contains("jpg") {
        "jpg"
    } else if content_type.contains("png") {
        "png"
    } else if content_type.contains("gif") {
        "gif"
    } else if content_type.contains("webp") {
        "webp"
    } else {
        let tail = url.rsplit('.').next().unwrap_or("");
        let tail = tail.split('?').next().unwrap_or("").to_lowercase();
        match tail.as_str() {
            "png" => "png",
            "gif" => "gif",
            "webp" => "webp",
            _ => "jpg",
        }
    }
}

fn host_of(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("the web")
        .trim_start_matches("www.")
        .to_string()
}
