//! Caller-side helpers for guarding actions with a rate limiter.

use tracing::info;

use super::key::RateLimitKey;
use super::limiter::{RateLimitPolicy, RateLimiter};
use super::store::CounterStore;
use crate::error::{LoginGuardError, Result};

/// Check `key` against `limiter`, folding a rate limit decision into a bool.
///
/// Returns `Ok(false)` when the key is over its limit. Backend failures are
/// still returned as errors so the caller can decide whether to fail open
/// or closed.
pub async fn check_rate_limit<S: CounterStore>(
    limiter: &RateLimiter<S>,
    key: &str,
) -> Result<bool> {
    match limiter.allow(key).await {
        Ok(allowed) => Ok(allowed),
        Err(LoginGuardError::RateLimitExceeded { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Throttles login attempts per email address.
pub struct LoginThrottle<S> {
    limiter: RateLimiter<S>,
}

impl<S: CounterStore> LoginThrottle<S> {
    pub fn new(store: S, policy: RateLimitPolicy) -> Self {
        Self {
            limiter: RateLimiter::with_policy(store, policy),
        }
    }

    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// Count a login attempt for `email`.
    ///
    /// Call this before verifying credentials. `Ok(false)` means the
    /// attempt must be refused without checking the password.
    pub async fn check_login(&self, email: &str) -> Result<bool> {
        let key = RateLimitKey::login(email)?;
        let allowed = check_rate_limit(&self.limiter, key.as_str()).await?;
        if !allowed {
            info!(key = %key, "Login attempt throttled");
        }
        Ok(allowed)
    }

    /// Clear the attempt counter for `email`, e.g. after a successful
    /// password reset.
    pub async fn forgive(&self, email: &str) -> Result<bool> {
        let key = RateLimitKey::login(email)?;
        self.limiter.reset(key.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ratelimit::store::test_support::UnavailableStore;
    use crate::ratelimit::MemoryCounterStore;

    fn policy(limit: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn test_check_rate_limit_returns_false_when_exceeded() {
        let limiter = RateLimiter::with_policy(MemoryCounterStore::new(), policy(2));

        assert!(check_rate_limit(&limiter, "login:a@example.com").await.unwrap());
        assert!(check_rate_limit(&limiter, "login:a@example.com").await.unwrap());
        assert!(!check_rate_limit(&limiter, "login:a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_rate_limit_keeps_backend_errors() {
        let limiter = RateLimiter::new(UnavailableStore);

        let err = check_rate_limit(&limiter, "login:a@example.com").await.unwrap_err();
        assert!(matches!(err, LoginGuardError::Backend(_)));
    }

    #[tokio::test]
    async fn test_login_throttle_shares_quota_across_email_case() {
        let throttle = LoginThrottle::new(MemoryCounterStore::new(), policy(2));

        assert!(throttle.check_login("a@example.com").await.unwrap());
        assert!(throttle.check_login("A@Example.com").await.unwrap());
        assert!(!throttle.check_login(" a@EXAMPLE.com ").await.unwrap());

        assert!(throttle.check_login("b@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_login_throttle_forgive() {
        let throttle = LoginThrottle::new(MemoryCounterStore::new(), policy(1));

        throttle.check_login("a@example.com").await.unwrap();
        assert!(!throttle.check_login("a@example.com").await.unwrap());

        assert!(throttle.forgive("a@example.com").await.unwrap());
        assert!(throttle.check_login("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_login_throttle_rejects_blank_email() {
        let throttle = LoginThrottle::new(MemoryCounterStore::new(), policy(1));
        assert!(matches!(
            throttle.check_login("  ").await,
            Err(LoginGuardError::InvalidKey(_))
        ));
    }
}
