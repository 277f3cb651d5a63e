//! Per-user cache of live search results.
//!
//! Search results are offered as inline buttons carrying only an index, so
//! the hits themselves must stay addressable until the user picks one. The
//! cache expires entries on its own; a pick after expiry is answered with a
//! "search again" message instead of a stale download.

use crate::extractor::SearchHit;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// TTL cache mapping a user id to their latest search results
#[derive(Clone)]
pub struct SearchCache {
    cache: Cache<i64, Arc<Vec<SearchHit>>>,
}

impl SearchCache {
    /// Create a cache where entries live for `ttl_secs`
    #[must_use]
    pub fn new(ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        Self { cache }
    }

    /// Replace the user's live results
    pub async fn store(&self, user_id: i64, hits: Vec<SearchHit>) {
        self.cache.insert(user_id, Arc::new(hits)).await;
    }

    /// Look up one hit by its button index
    pub async fn pick(&self, user_id: i64, index: usize) -> Option<SearchHit> {
        let hits = self.cache.get(&user_id).await?;
        hits.get(index).cloned()
    }

    /// Drop the user's results (after a successful pick)
    pub async fn clear(&self, user_id: i64) {
        self.cache.invalidate(&user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            title: format!("title {id}"),
            url: format!("https://www.youtube.com/watch?v={id}"),
            duration_secs: Some(60),
            channel: "chan".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pick_by_index() {
        let cache = SearchCache::new(60, 100);
        cache.store(1, vec![hit("a"), hit("b")]).await;

        assert_eq!(cache.pick(1, 1).await.map(|h| h.id), Some("b".to_string()));
        assert!(cache.pick(1, 5).await.is_none());
        assert!(cache.pick(2, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_results() {
        let cache = SearchCache::new(60, 100);
        cache.store(1, vec![hit("a")]).await;
        cache.clear(1).await;
        assert!(cache.pick(1, 0).await.is_none());
    }
}
