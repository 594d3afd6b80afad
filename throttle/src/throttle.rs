use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Returned when a key has used up its budget for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit of {limit} calls per {window:?} exceeded")]
pub struct RateLimitExceeded {
    pub limit: u32,
    pub window: Duration,
}

/// Counts calls per key over a sliding window.
///
/// A call is admitted as long as fewer than `limit` calls for the same key
/// fall within the window ending now. Timestamps are pruned lazily on every
/// check, so memory use is bounded by `limit` per live key.
#[derive(Debug)]
pub struct SlidingWindow<K> {
    window: Duration,
    hits: HashMap<K, Vec<Instant>>,
}

impl<K> SlidingWindow<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a call for `key` if it stays within `limit` calls per window.
    pub fn check(&mut self, key: K, limit: u32) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        let window = self.window;

        let hits = self.hits.entry(key.clone()).or_default();
        hits.retain(|at| now.duration_since(*at) < window);

        if hits.len() as u32 >= limit {
            tracing::debug!(?key, limit, "Rate limit exceeded");
            return Err(RateLimitExceeded { limit, window });
        }

        hits.push(now);
        Ok(())
    }

    /// Drops all tracked calls for keys matching the predicate.
    ///
    /// Called when a connection goes away so its counters do not linger.
    pub fn forget<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.hits.retain(|key, _| !predicate(key));
    }
}
