//! Core rate limiter implementation.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::store::{CounterRecord, CounterStore, HitOutcome};
use crate::error::{LoginGuardError, Result};

/// Default number of requests allowed per window.
pub const DEFAULT_LIMIT: u64 = 5;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Longest window a policy accepts (one year).
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How many requests a key may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    limit: u64,
    window: Duration,
}

impl RateLimitPolicy {
    /// Create a policy. `limit` must be non-zero and `window` must lie in
    /// `(0, MAX_WINDOW]`.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(LoginGuardError::Config("limit must be at least 1".into()));
        }
        if window.is_zero() {
            return Err(LoginGuardError::Config("window must be non-zero".into()));
        }
        if window > MAX_WINDOW {
            return Err(LoginGuardError::Config(format!(
                "window must be at most {}s, got {}s",
                MAX_WINDOW.as_secs(),
                window.as_secs()
            )));
        }
        Ok(Self { limit, window })
    }

    /// Maximum requests allowed in one window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
        }
    }
}

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub allowed: bool,
    /// Requests counted in the current window, including this one if allowed
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window expires and the key starts fresh
    pub reset_after: Duration,
}

impl RateLimitStatus {
    fn from_outcome(outcome: &HitOutcome, limit: u64) -> Self {
        let record = outcome.record();
        Self {
            key: record.key.clone(),
            allowed: outcome.is_allowed(),
            count: record.count,
            limit,
            remaining: limit.saturating_sub(record.count),
            reset_after: record.ttl,
        }
    }
}

/// A per-key fixed-window rate limiter over a [`CounterStore`].
///
/// The first request for a key opens a window of `policy.window()` and
/// every request inside it is counted until `policy.limit()` is reached.
/// Requests past the limit are rejected without being counted. When the
/// store expires the record, the next request opens a new window.
///
/// The limiter keeps no state of its own; the whole decision is delegated
/// to [`CounterStore::increment_and_check`], so concurrent callers are only
/// as consistent as the store's implementation of it.
pub struct RateLimiter<S> {
    store: S,
    policy: RateLimitPolicy,
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a rate limiter with the default policy (5 requests per 60s).
    pub fn new(store: S) -> Self {
        Self::with_policy(store, RateLimitPolicy::default())
    }

    pub fn with_policy(store: S, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Count a request for `key` and report the full decision.
    ///
    /// A rejected request is reported with `allowed == false`, not as an
    /// error. Store failures are returned as [`LoginGuardError::Backend`].
    pub async fn check(&self, key: &str) -> Result<RateLimitStatus> {
        ensure_key(key)?;

        trace!(key, limit = self.policy.limit, "Checking rate limit");

        let outcome = self
            .store
            .increment_and_check(key, self.policy.limit, self.policy.window)
            .await
            .map_err(|e| {
                warn!(key, error = %e, "Counter store failed during rate limit check");
                e
            })?;

        let status = RateLimitStatus::from_outcome(&outcome, self.policy.limit);

        if !status.allowed {
            debug!(
                key,
                count = status.count,
                limit = status.limit,
                "Rate limit exceeded"
            );
        } else if status.count == 1 {
            debug!(key, window = ?self.policy.window, "Opened rate limit window");
        }

        Ok(status)
    }

    /// Count a request for `key`.
    ///
    /// Returns `Ok(true)` if the request is within the limit and
    /// [`LoginGuardError::RateLimitExceeded`] if the key has used its
    /// quota for the current window.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        let status = self.check(key).await?;
        if status.allowed {
            Ok(true)
        } else {
            Err(LoginGuardError::RateLimitExceeded {
                key: status.key,
                retry_after: status.reset_after,
            })
        }
    }

    /// Read the live counter for `key` without counting a request.
    pub async fn inspect(&self, key: &str) -> Result<Option<CounterRecord>> {
        ensure_key(key)?;
        Ok(self.store.get(key).await?)
    }

    /// Forget the counter for `key`, giving it a fresh window on its next
    /// request. Returns whether a live counter was removed.
    pub async fn reset(&self, key: &str) -> Result<bool> {
        ensure_key(key)?;
        let removed = self.store.remove(key).await?;
        debug!(key, removed, "Reset rate limit counter");
        Ok(removed)
    }
}

fn ensure_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(LoginGuardError::InvalidKey("key must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ratelimit::store::test_support::{TwoStepStore, UnavailableStore};
    use crate::ratelimit::MemoryCounterStore;

    const KEY: &str = "login:a@example.com";

    fn limiter(limit: u64, window_secs: u64) -> RateLimiter<MemoryCounterStore> {
        let policy = RateLimitPolicy::new(limit, Duration::from_secs(window_secs)).unwrap();
        RateLimiter::with_policy(MemoryCounterStore::new(), policy)
    }

    #[test]
    fn test_default_policy() {
        let policy = RateLimitPolicy::default();
        assert_eq!(policy.limit(), 5);
        assert_eq!(policy.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_rejects_zero_values() {
        assert!(RateLimitPolicy::new(0, Duration::from_secs(60)).is_err());
        assert!(RateLimitPolicy::new(5, Duration::ZERO).is_err());
    }

    #[test]
    fn test_policy_window_upper_bound() {
        assert!(RateLimitPolicy::new(5, MAX_WINDOW).is_ok());
        assert!(matches!(
            RateLimitPolicy::new(5, MAX_WINDOW + Duration::from_secs(1)),
            Err(LoginGuardError::Config(_))
        ));
        assert!(RateLimitPolicy::new(5, Duration::from_secs(u64::MAX)).is_err());
    }

    #[tokio::test]
    async fn test_longest_window_allows_requests() {
        let policy = RateLimitPolicy::new(2, MAX_WINDOW).unwrap();
        let limiter = RateLimiter::with_policy(MemoryCounterStore::new(), policy);

        assert!(limiter.allow(KEY).await.unwrap());
        assert!(limiter.allow(KEY).await.unwrap());
        let err = limiter.allow(KEY).await.unwrap_err();
        assert!(err.retry_after().unwrap() <= MAX_WINDOW);
    }

    #[tokio::test]
    async fn test_first_request_creates_counter() {
        let limiter = RateLimiter::new(MemoryCounterStore::new());

        assert!(limiter.allow(KEY).await.unwrap());

        let record = limiter.inspect(KEY).await.unwrap().unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_limit_reached() {
        let limiter = limiter(3, 60);

        for _ in 0..3 {
            assert!(limiter.allow(KEY).await.unwrap());
        }

        let err = limiter.allow(KEY).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(matches!(err, LoginGuardError::RateLimitExceeded { ref key, .. } if key == KEY));
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_counted() {
        let limiter = limiter(3, 60);

        for _ in 0..10 {
            let _ = limiter.allow(KEY).await;
        }

        assert_eq!(limiter.inspect(KEY).await.unwrap().unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_check_reports_remaining() {
        let limiter = limiter(3, 60);

        let status = limiter.check(KEY).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.count, 1);
        assert_eq!(status.limit, 3);
        assert_eq!(status.remaining, 2);
        assert!(status.reset_after <= Duration::from_secs(60));

        limiter.check(KEY).await.unwrap();
        limiter.check(KEY).await.unwrap();

        let status = limiter.check(KEY).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.count, 3);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_example_window_renewal() {
        let limiter = limiter(5, 60);

        for i in 1..=5 {
            assert!(limiter.allow(KEY).await.unwrap(), "call {} should pass", i);
        }
        let err = limiter.allow(KEY).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(limiter.allow(KEY).await.unwrap());
        assert_eq!(limiter.inspect(KEY).await.unwrap().unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_per_key() {
        let limiter = limiter(1, 60);

        limiter.allow("login:a@example.com").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.allow("login:b@example.com").await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        // a's window has lapsed, b's has not
        assert!(limiter.allow("login:a@example.com").await.is_ok());
        assert!(limiter.allow("login:b@example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let limiter = limiter(2, 60);

        limiter.allow("login:a@example.com").await.unwrap();
        limiter.allow("login:a@example.com").await.unwrap();
        assert!(limiter.allow("login:a@example.com").await.is_err());

        assert!(limiter.allow("login:b@example.com").await.unwrap());
        assert_eq!(
            limiter.inspect("login:b@example.com").await.unwrap().unwrap().count,
            1
        );
    }

    #[tokio::test]
    async fn test_reset_clears_quota() {
        let limiter = limiter(1, 60);

        limiter.allow(KEY).await.unwrap();
        assert!(limiter.allow(KEY).await.is_err());

        assert!(limiter.reset(KEY).await.unwrap());
        assert!(limiter.allow(KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let limiter = limiter(1, 60);
        assert!(matches!(
            limiter.allow("").await,
            Err(LoginGuardError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let limiter = RateLimiter::new(UnavailableStore);

        let err = limiter.allow(KEY).await.unwrap_err();
        assert!(matches!(err, LoginGuardError::Backend(_)));
        assert!(!err.is_rate_limited());

        assert!(matches!(
            limiter.inspect(KEY).await,
            Err(LoginGuardError::Backend(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_exceed_limit() {
        let limiter = Arc::new(limiter(5, 60));

        let attempts = (0..64).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow(KEY).await.is_ok() })
        });
        let allowed = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(allowed, 5);
        assert_eq!(limiter.inspect(KEY).await.unwrap().unwrap().count, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_at_boundary() {
        let limiter = Arc::new(limiter(5, 60));
        for _ in 0..4 {
            limiter.allow(KEY).await.unwrap();
        }

        let attempts = (0..16).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow(KEY).await.is_ok() })
        });
        let allowed = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(allowed, 1);
    }

    #[tokio::test]
    async fn test_two_step_store_sequential_semantics() {
        let policy = RateLimitPolicy::new(3, Duration::from_secs(60)).unwrap();
        let limiter = RateLimiter::with_policy(TwoStepStore::default(), policy);

        for _ in 0..3 {
            assert!(limiter.allow(KEY).await.unwrap());
        }
        assert!(limiter.allow(KEY).await.unwrap_err().is_rate_limited());
        assert_eq!(limiter.inspect(KEY).await.unwrap().unwrap().count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_step_store_window_renewal() {
        let policy = RateLimitPolicy::new(1, Duration::from_secs(60)).unwrap();
        let limiter = RateLimiter::with_policy(TwoStepStore::default(), policy);

        limiter.allow(KEY).await.unwrap();
        assert!(limiter.allow(KEY).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.allow(KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_dyn_store() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let first = RateLimiter::new(store.clone());
        let second = RateLimiter::new(store);

        for _ in 0..5 {
            first.allow(KEY).await.unwrap();
        }
        assert!(second.allow(KEY).await.is_err());
    }
}
