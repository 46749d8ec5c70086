//! C6: Rate Limiter — a global concurrency cap plus a per-domain token
//! bucket. See spec §4.5. The per-domain bucket generalizes
//! `SiliconLion-sumi`'s `DomainState::can_request`/`time_until_next_request`
//! pair from a fixed per-run counter to a continuously refilling rate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};

/// A single domain's refilling token bucket plus its minimum inter-request
/// spacing (the higher of `requestDelayMs` and any robots-declared delay).
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    last_request: Option<Instant>,
    min_spacing: Duration,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, min_spacing: Duration) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: rate_per_sec.max(0.001),
            last_refill: Instant::now(),
            last_request: None,
            min_spacing,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// How long the caller must wait before a token can be taken, given the
    /// current refill state and the minimum-spacing floor.
    fn wait_for(&mut self, now: Instant) -> Duration {
        self.refill(now);
        let spacing_wait = self
            .last_request
            .map(|last| {
                let since = now.saturating_duration_since(last);
                self.min_spacing.saturating_sub(since)
            })
            .unwrap_or(Duration::ZERO);

        let token_wait = if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        };

        spacing_wait.max(token_wait)
    }

    fn consume(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.last_request = Some(now);
    }

    fn set_min_spacing(&mut self, spacing: Duration) {
        self.min_spacing = spacing;
    }
}

/// Global concurrency cap + per-domain token buckets, keyed by host in a
/// concurrent map so distinct domains never contend on the same lock.
pub struct RateLimiter {
    global: Arc<Semaphore>,
    domains: DashMap<String, Arc<Mutex<TokenBucket>>>,
    default_rate_per_sec: f64,
    default_min_spacing: Duration,
}

/// An acquired global permit. Dropping it (including on cancellation)
/// releases the slot — no permit is ever leaked.
pub struct GlobalPermit(#[allow(dead_code)] tokio::sync::OwnedSemaphorePermit);

impl RateLimiter {
    pub fn new(max_concurrent_requests: usize, rate_per_sec: f64, request_delay_ms: u64) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            domains: DashMap::new(),
            default_rate_per_sec: rate_per_sec,
            default_min_spacing: Duration::from_millis(request_delay_ms),
        }
    }

    /// Blocks until a global concurrency slot is free.
    pub async fn acquire_global(&self) -> GlobalPermit {
        let permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("global rate-limit semaphore is never closed");
        GlobalPermit(permit)
    }

    /// Number of global permits immediately available — used by
    /// cancellation-safety tests to assert no permit leaked.
    pub fn available_global_permits(&self) -> usize {
        self.global.available_permits()
    }

    fn bucket_for(&self, host: &str) -> Arc<Mutex<TokenBucket>> {
        self.domains
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(
                    self.default_rate_per_sec,
                    self.default_min_spacing,
                )))
            })
            .clone()
    }

    /// Raise a domain's minimum inter-request spacing to at least `delay`
    /// (used when robots.txt reports a larger crawl-delay than the
    /// configured floor).
    pub async fn ensure_min_spacing(&self, host: &str, delay: Duration) {
        if delay <= self.default_min_spacing {
            return;
        }
        let bucket = self.bucket_for(host);
        let mut guard = bucket.lock().await;
        if delay > guard.min_spacing {
            guard.set_min_spacing(delay);
        }
    }

    /// Blocks until a token is available for `host`, honoring both the
    /// refill rate and the minimum inter-request spacing.
    pub async fn acquire_domain(&self, host: &str) {
        let bucket = self.bucket_for(host);
        loop {
            let wait = {
                let mut guard = bucket.lock().await;
                let now = Instant::now();
                let wait = guard.wait_for(now);
                if wait.is_zero() {
                    guard.consume(now);
                    return;
                }
                wait
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_permit_release_does_not_leak() {
        let limiter = RateLimiter::new(2, 100.0, 0);
        assert_eq!(limiter.available_global_permits(), 2);
        {
            let _p1 = limiter.acquire_global().await;
            let _p2 = limiter.acquire_global().await;
            assert_eq!(limiter.available_global_permits(), 0);
        }
        // Dropped: both permits are back immediately.
        assert_eq!(limiter.available_global_permits(), 2);
    }

    #[tokio::test]
    async fn domain_bucket_allows_rate_within_budget() {
        let limiter = RateLimiter::new(10, 1000.0, 0);
        // High rate: back-to-back acquires should not need to sleep.
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire_domain("h").await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn min_spacing_is_enforced_even_with_high_rate() {
        let limiter = RateLimiter::new(10, 1000.0, 50);
        limiter.acquire_domain("h").await;
        let start = Instant::now();
        limiter.acquire_domain("h").await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn ensure_min_spacing_raises_but_never_lowers() {
        let limiter = RateLimiter::new(10, 1000.0, 10);
        limiter.ensure_min_spacing("h", Duration::from_millis(5)).await;
        limiter.acquire_domain("h").await;
        let start = Instant::now();
        limiter.acquire_domain("h").await;
        // The configured floor (10ms) should still win over the smaller
        // robots-declared delay (5ms).
        assert!(start.elapsed() >= Duration::from_millis(8));
    }
}
