//! Per-account token-bucket rate limiting.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate budget must be positive (tokens_per_sec={tokens_per_sec}, burst={burst})")]
    InvalidBudget { tokens_per_sec: u32, burst: u32 },
}

/// Token bucket guarding one account's request budget.
///
/// Thread-safe and cheap to clone; every network call an account makes goes
/// through [`AccountLimiter::acquire`] first.
#[derive(Clone)]
pub struct AccountLimiter {
    inner: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl AccountLimiter {
    pub fn new(tokens_per_sec: u32, burst: u32) -> Result<Self, LimiterError> {
        let per_sec = NonZeroU32::new(tokens_per_sec).ok_or(LimiterError::InvalidBudget {
            tokens_per_sec,
            burst,
        })?;
        let burst = NonZeroU32::new(burst.max(1)).ok_or(LimiterError::InvalidBudget {
            tokens_per_sec,
            burst: 0,
        })?;
        let quota = Quota::per_second(per_sec).allow_burst(burst);
        Ok(Self {
            inner: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Wait until one token is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Take a token if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

impl std::fmt::Debug for AccountLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLimiter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_rejected() {
        assert!(AccountLimiter::new(0, 10).is_err());
    }

    #[test]
    fn burst_tokens_are_available_immediately() {
        let limiter = AccountLimiter::new(5, 3).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        // Bucket drained; the fourth take inside the same instant fails.
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = AccountLimiter::new(1000, 1).unwrap();
        limiter.acquire().await;
        limiter.acquire().await; // refills within a millisecond at this rate
    }
}
