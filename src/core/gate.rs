//! Request admission: duplicate suppression and mutual exclusion.
//!
//! Two structures per (user, action key) token: a TTL cache of recently
//! admitted tokens (the duplicate-suppression window) and a live set of
//! in-flight tokens (mutual exclusion). The duplicate check runs first, so
//! a rapid resubmission is reported as a duplicate even while the original
//! job is still running.

use moka::future::Cache;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Composite token identifying one semantic request of one user
type ActionToken = (i64, String);

/// Admission verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Token admitted; the caller owns it until `release`
    Admitted,
    /// An identical token was admitted within the suppression window
    DuplicateRejected,
    /// An identical token is currently in flight
    BusyRejected,
}

/// Admission gate for download/search/probe requests.
///
/// At most one job per (user, action key) is ever in flight, and an
/// identical request within the suppression window is rejected outright.
/// Admission stamps the window regardless of how the job later ends.
pub struct ActionGate {
    /// Recently admitted tokens; entries expire after the window (moka
    /// purges lazily, which is all the sliding expiry needs)
    recent: Cache<ActionToken, ()>,
    /// Tokens with a live job
    in_flight: Mutex<HashSet<ActionToken>>,
}

impl ActionGate {
    /// Create a gate with the given suppression window
    #[must_use]
    pub fn new(window: Duration, max_capacity: u64) -> Self {
        let recent = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(window)
            .build();

        Self {
            recent,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Try to admit a request.
    ///
    /// The duplicate window is consulted before the in-flight set; only an
    /// actual admission stamps the window.
    pub async fn admit(&self, user_id: i64, action_key: &str) -> Admission {
        let token = (user_id, action_key.to_string());

        if self.recent.get(&token).await.is_some() {
            debug!(user_id, action_key, "duplicate request suppressed");
            return Admission::DuplicateRejected;
        }

        {
            let mut live = self.in_flight.lock().await;
            if !live.insert(token.clone()) {
                debug!(user_id, action_key, "identical job already in flight");
                return Admission::BusyRejected;
            }
        }

        self.recent.insert(token, ()).await;
        Admission::Admitted
    }

    /// Release an admitted token.
    ///
    /// Idempotent; releasing a token that is not in flight is a no-op.
    /// Every admitted job must end up here exactly once, on every exit path.
    pub async fn release(&self, user_id: i64, action_key: &str) {
        let token = (user_id, action_key.to_string());
        self.in_flight.lock().await.remove(&token);
    }

    /// Number of jobs currently in flight (for monitoring and tests)
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
