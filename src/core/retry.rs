//! Bounded retry around the extractor, with one authentication fallback.
//!
//! Retry semantics are data ([`RetryPolicy`]), not control flow scattered
//! through handlers. The executor runs synchronously on the blocking worker
//! thread that owns the extractor call; the deadline around the whole job is
//! the orchestrator's concern, not this module's.

use crate::core::error::JobError;
use crate::extractor::{ExtractError, Extractor, FetchConfig, Fetched, RequestKind};
use std::time::Duration;
use tracing::{debug, warn};

/// Words that mark an error as an authentication / bot-detection condition,
/// matched case-insensitively against the error text.
pub const AUTH_MARKERS: &[&str] = &["bot", "sign in", "cookies", "authentication", "private"];

/// Retry tuning for one job
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt cap (the auth fallback call is on top of this)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::RETRY_MAX_ATTEMPTS,
            delay: Duration::from_secs(crate::config::RETRY_DELAY_SECS),
        }
    }
}

/// Whether this failure looks like the platform demanding sign-in.
///
/// Pre-classified `AuthRequired` errors qualify directly; other variants
/// qualify when their text carries one of the [`AUTH_MARKERS`].
#[must_use]
pub fn is_auth_class(err: &ExtractError) -> bool {
    if matches!(err, ExtractError::AuthRequired(_)) {
        return true;
    }
    let text = err.to_string().to_lowercase();
    AUTH_MARKERS.iter().any(|marker| text.contains(marker))
}

const fn is_fatal(err: &ExtractError) -> bool {
    matches!(
        err,
        ExtractError::Unsupported(_) | ExtractError::ToolMissing(_)
    )
}

/// Run one fetch under the policy.
///
/// - transient failures are retried up to `max_attempts`, with the fixed
///   delay in between and a rotated client signature per attempt;
/// - the first auth-class failure gets exactly one immediate extra call
///   with [`FetchConfig::relaxed`] applied (so the total number of
///   underlying calls never exceeds `max_attempts + 1`); any later
///   auth-class failure is fatal;
/// - unsupported targets and missing tools are fatal immediately.
///
/// # Errors
///
/// Returns the classified [`JobError`]; an exhausted retry loop carries the
/// last underlying cause and the attempt count.
pub fn run(
    extractor: &dyn Extractor,
    url: &str,
    kind: RequestKind,
    base: &FetchConfig,
    policy: &RetryPolicy,
) -> Result<Fetched, JobError> {
    let mut config = base.clone();
    let mut relaxation_spent = false;
    let mut last_cause = String::new();

    for attempt in 1..=policy.max_attempts {
        config.rotate_identity();

        let err = match extractor.fetch(url, kind, &config) {
            Ok(out) => return Ok(out),
            Err(err) => err,
        };

        if is_fatal(&err) {
            return Err(JobError::Unsupported(err.to_string()));
        }

        if is_auth_class(&err) {
            if relaxation_spent {
                warn!(url, attempt, "auth error persists after relaxed retry");
                return Err(JobError::AuthRequired);
            }
            relaxation_spent = true;
            config = config.relaxed();
            debug!(url, attempt, "auth-class failure, retrying with relaxed config");

            match extractor.fetch(url, kind, &config) {
                Ok(out) => return Ok(out),
                Err(e2) if is_fatal(&e2) => {
                    return Err(JobError::Unsupported(e2.to_string()));
                }
                Err(e2) if is_auth_class(&e2) => {
                    warn!(url, "relaxed retry still blocked by authentication");
                    return Err(JobError::AuthRequired);
                }
                Err(e2) => last_cause = e2.to_string(),
            }
        } else {
            warn!(url, attempt, error = %err, "attempt failed");
            last_cause = err.to_string();
        }

        if attempt < policy.max_attempts {
            std::thread::sleep(policy.delay);
        }
    }

    Err(JobError::TransientFailure {
        attempts: policy.max_attempts,
        cause: last_cause,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::MockExtractor;
    use std::path::PathBuf;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }

    fn config() -> FetchConfig {
        FetchConfig::new(PathBuf::from("downloads"), None)
    }

    fn fetched() -> Fetched {
        Fetched {
            path: PathBuf::from("downloads/x.mp4"),
            title: "clip".to_string(),
        }
    }

    #[test]
    fn test_auth_marker_matching_is_case_insensitive() {
        assert!(is_auth_class(&ExtractError::Other(
            "Sign in to confirm you're not a bot".to_string()
        )));
        assert!(is_auth_class(&ExtractError::Other(
            "This video is PRIVATE".to_string()
        )));
        assert!(!is_auth_class(&ExtractError::Network(
            "connection reset".to_string()
        )));
    }

    #[test]
    fn test_transient_errors_retried_to_cap() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_fetch()
            .times(3)
            .returning(|_, _, _| Err(ExtractError::Network("reset".to_string())));

        let err = run(&extractor, "u", RequestKind::Video, &config(), &fast_policy());
        assert_eq!(
            err,
            Err(JobError::TransientFailure {
                attempts: 3,
                cause: "network error: reset".to_string(),
            })
        );
    }

    #[test]
    fn test_auth_then_relaxed_success_makes_two_calls() {
        let mut extractor = MockExtractor::new();
        let mut calls = 0;
        extractor.expect_fetch().times(2).returning(move |_, _, cfg| {
            calls += 1;
            if calls == 1 {
                assert!(cfg.player_hints);
                Err(ExtractError::AuthRequired("sign in required".to_string()))
            } else {
                assert!(!cfg.player_hints, "fallback call must be relaxed");
                Ok(Fetched {
                    path: PathBuf::from("downloads/x.mp4"),
                    title: "clip".to_string(),
                })
            }
        });

        let out = run(&extractor, "u", RequestKind::Video, &config(), &fast_policy());
        assert!(out.is_ok());
    }

    #[test]
    fn test_second_auth_failure_is_fatal() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_fetch()
            .times(2)
            .returning(|_, _, _| Err(ExtractError::AuthRequired("sign in".to_string())));

        let err = run(&extractor, "u", RequestKind::Audio, &config(), &fast_policy());
        assert_eq!(err, Err(JobError::AuthRequired));
    }

    #[test]
    fn test_unsupported_fails_without_retry() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_fetch()
            .times(1)
            .returning(|_, _, _| Err(ExtractError::Unsupported("Unsupported URL".to_string())));

        let err = run(&extractor, "u", RequestKind::Video, &config(), &fast_policy());
        assert!(matches!(err, Err(JobError::Unsupported(_))));
    }

    #[test]
    fn test_tool_missing_fails_without_retry() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_fetch()
            .times(1)
            .returning(|_, _, _| Err(ExtractError::ToolMissing("ffmpeg".to_string())));

        let err = run(&extractor, "u", RequestKind::Audio, &config(), &fast_policy());
        assert!(matches!(err, Err(JobError::Unsupported(_))));
    }

    #[test]
    fn test_call_count_never_exceeds_attempts_plus_one() {
        let mut extractor = MockExtractor::new();
        let mut calls = 0;
        // First call auth-class, everything after transient: the relaxed
        // fallback plus the remaining attempts add up to max_attempts + 1.
        extractor.expect_fetch().times(4).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(ExtractError::Other("blocked by cookies wall".to_string()))
            } else {
                Err(ExtractError::Network("timeout".to_string()))
            }
        });

        let err = run(&extractor, "u", RequestKind::Video, &config(), &fast_policy());
        assert!(matches!(err, Err(JobError::TransientFailure { .. })));
    }

    #[test]
    fn test_success_short_circuits() {
        let mut extractor = MockExtractor::new();
        extractor.expect_fetch().times(1).returning(|_, _, _| {
            Ok(Fetched {
                path: PathBuf::from("downloads/x.mp4"),
                title: "clip".to_string(),
            })
        });

        let out = run(&extractor, "u", RequestKind::Video, &config(), &fast_policy());
        assert_eq!(out.map(|f| f.title), Ok(fetched().title));
    }
}
