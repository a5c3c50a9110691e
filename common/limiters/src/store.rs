use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::gauge;
use thiserror::Error;
use tokio::time::{interval, Instant};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
    #[error("rate limit store returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// What the store decided for a single hit against a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// The hit was recorded; `count` includes it.
    Admitted { count: u64 },
    /// The window is full; nothing was recorded.
    Rejected { count: u64, retry_after: Duration },
}

/// Backing store for per-client sliding windows.
///
/// Implementations must check and record atomically: two concurrent hits for the
/// same key must never both be admitted into the last free slot. The store may be
/// remote, callers bound each call with a timeout and fail open on errors.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowDecision, StoreError>;
}

/// Sliding log of hit instants per key, kept in process memory.
///
/// Each key's log only holds hits younger than the window, so memory is bounded
/// by `limit` entries per active key. Keys that went idle are dropped by
/// `evict_idle`, which the server runs periodically.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    logs: Arc<DashMap<String, VecDeque<Instant>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Drop every key whose most recent hit is older than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        self.logs.retain(|_, log| {
            log.back()
                .is_some_and(|last| now.duration_since(*last) < max_idle)
        });
    }

    /// Evicts idle keys and reports the tracked key count every `every`,
    /// needs to be spawned in a separate task.
    pub async fn clean_state(&self, max_idle: Duration, every: Duration) {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            self.evict_idle(max_idle);
            gauge!("rate_limiter_tracked_keys").set(self.logs.len() as f64);
        }
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowDecision, StoreError> {
        let now = Instant::now();
        // The entry guard holds the shard lock, making check-and-record atomic per key
        let mut log = self.logs.entry(key.to_string()).or_default();

        while log
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= window)
        {
            log.pop_front();
        }

        let count = log.len() as u64;
        if count < limit {
            log.push_back(now);
            return Ok(WindowDecision::Admitted { count: count + 1 });
        }

        // The window frees a slot when its oldest hit ages out
        let retry_after = match log.front() {
            Some(oldest) => window.saturating_sub(now.duration_since(*oldest)),
            None => window,
        };
        Ok(WindowDecision::Rejected { count, retry_after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_rejects() {
        let store = InMemoryStore::new();

        for expected in 1..=3 {
            assert_eq!(
                store.hit("client", 3, WINDOW).await,
                Ok(WindowDecision::Admitted { count: expected })
            );
        }

        match store.hit("client", 3, WINDOW).await {
            Ok(WindowDecision::Rejected { count, retry_after }) => {
                assert_eq!(count, 3);
                assert_eq!(retry_after, WINDOW);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_as_hits_age_out() {
        let store = InMemoryStore::new();

        store.hit("client", 2, WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        store.hit("client", 2, WINDOW).await.unwrap();

        // Full, and the first hit has 30s left to live
        match store.hit("client", 2, WINDOW).await.unwrap() {
            WindowDecision::Rejected { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            store.hit("client", 2, WINDOW).await,
            Ok(WindowDecision::Admitted { count: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let store = InMemoryStore::new();

        store.hit("a", 1, WINDOW).await.unwrap();
        assert!(matches!(
            store.hit("a", 1, WINDOW).await,
            Ok(WindowDecision::Rejected { .. })
        ));
        assert_eq!(
            store.hit("b", 1, WINDOW).await,
            Ok(WindowDecision::Admitted { count: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_always_rejects() {
        let store = InMemoryStore::new();

        assert_eq!(
            store.hit("client", 0, WINDOW).await,
            Ok(WindowDecision::Rejected {
                count: 0,
                retry_after: WINDOW
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_idle_keys() {
        let store = InMemoryStore::new();

        store.hit("old", 5, WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_secs(90)).await;
        store.hit("fresh", 5, WINDOW).await.unwrap();

        store.evict_idle(WINDOW);

        assert_eq!(store.len(), 1);
        assert!(store.logs.contains_key("fresh"));
    }
}
