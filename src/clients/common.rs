//! Shared shape for the REE/AEMET/OpenWeatherMap clients: a token-bucket
//! rate limiter per client instance and a retry-with-backoff helper.
//!
//! The rate limiter wraps `governor` with a polling loop so callers
//! suspend until a token is free rather than ever dropping a request.

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

use crate::error::CoreResult;

/// A named, per-client token-bucket limiter. `max_requests` tokens refill
/// over `window`; a burst up to `max_requests` is allowed.
pub struct RateLimiter {
    name: &'static str,
    clock: DefaultClock,
    inner: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    pub fn new(name: &'static str, max_requests: u32, window: Duration) -> Self {
        let quota = Quota::with_period(window / max_requests.max(1))
            .expect("window/max_requests must be a positive duration")
            .allow_burst(NonZeroU32::new(max_requests).expect("max_requests must be > 0"));
        let clock = DefaultClock::default();
        Self {
            name,
            inner: GovernorRateLimiter::direct_with_clock(quota, &clock),
            clock,
        }
    }

    /// Suspends the caller until a token is available. Never drops the
    /// request.
    pub async fn acquire(&self) {
        loop {
            match self.inner.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    if wait > Duration::ZERO {
                        tokio::time::sleep(wait).await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Retries `op` on transient errors with exponential backoff and jitter,
/// up to `max_attempts` total tries. Non-retryable errors (anything for
/// which `CoreError::is_transient()` is false) are returned immediately.
pub async fn retry_transient<F, Fut, T>(
    client_name: &'static str,
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
    mut op: F,
) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    use backoff::backoff::Backoff;
    use backoff::ExponentialBackoffBuilder;

    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(initial_interval)
        .with_max_interval(max_interval)
        .with_multiplier(2.0)
        .with_randomization_factor(0.3)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let wait = backoff.next_backoff().unwrap_or(initial_interval);
                warn!(
                    client = client_name,
                    attempt, ?wait, error = %e, "retrying after transient upstream error"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fixed-delay retry variant, for upstreams whose rate-limit responses
/// ask for a constant cooldown (REE's 429 policy, AEMET/SIAR historical
/// endpoints) rather than exponential growth.
pub async fn retry_fixed_delay<F, Fut, T>(
    client_name: &'static str,
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(client = client_name, attempt, ?delay, error = %e, "retrying after fixed delay");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_suspends() {
        let limiter = RateLimiter::new("test", 2, Duration::from_millis(200));
        limiter.acquire().await;
        limiter.acquire().await;
        // third acquire must wait, but must still resolve, not error
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() > Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: CoreResult<()> = retry_transient(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::TransientUpstream {
                        source_name: "test",
                        message: "boom".into(),
                    })
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_validation_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: CoreResult<()> = retry_transient(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::ValidationError("bad input".into()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
