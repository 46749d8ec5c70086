//! Built-in middlewares the core recognizes (spec §4.6): `RateLimit`,
//! `UserAgent`, `Logging`, `Stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MiddlewareError;
use crate::rate_limiter::RateLimiter;
use crate::types::{Request, Response};

use super::{Middleware, RequestOutcome};

/// Defers to C6: the worker pool already calls [`RateLimiter::acquire_global`]
/// / [`RateLimiter::acquire_domain`] before building a request, so this
/// middleware's hooks are observational only — it exists so rate-limit
/// activity is visible in the same pipeline trace as every other middleware.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn on_request(&self, req: Request) -> Result<RequestOutcome, MiddlewareError> {
        tracing::trace!(
            url = %req.url,
            available_global = self.limiter.available_global_permits(),
            "rate limit middleware observed request"
        );
        Ok(RequestOutcome::Continue(req))
    }
}

/// Sets the configured user agent header on every request.
pub struct UserAgentMiddleware {
    user_agent: String,
}

impl UserAgentMiddleware {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl Middleware for UserAgentMiddleware {
    fn name(&self) -> &str {
        "user_agent"
    }

    async fn on_request(&self, mut req: Request) -> Result<RequestOutcome, MiddlewareError> {
        req.headers
            .insert("User-Agent".to_string(), self.user_agent.clone());
        Ok(RequestOutcome::Continue(req))
    }
}

/// Tracing-only observability; never mutates the request/response.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_request(&self, req: Request) -> Result<RequestOutcome, MiddlewareError> {
        tracing::debug!(url = %req.url, depth = req.depth, "fetching");
        Ok(RequestOutcome::Continue(req))
    }

    async fn on_response(&self, resp: Response, req: &Request) -> Result<Response, MiddlewareError> {
        tracing::debug!(url = %req.url, status = resp.status, "fetched");
        Ok(resp)
    }

    async fn on_exception(
        &self,
        err: &crate::error::CrawlError,
        req: &Request,
    ) -> Result<Option<Response>, MiddlewareError> {
        tracing::warn!(url = %req.url, error = %err, "fetch failed");
        Ok(None)
    }
}

/// Atomic request/response/error counters.
#[derive(Default)]
pub struct StatsMiddleware {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub errors: AtomicU64,
}

impl StatsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.responses.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Middleware for StatsMiddleware {
    fn name(&self) -> &str {
        "stats"
    }

    async fn on_request(&self, req: Request) -> Result<RequestOutcome, MiddlewareError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(RequestOutcome::Continue(req))
    }

    async fn on_response(&self, resp: Response, _req: &Request) -> Result<Response, MiddlewareError> {
        self.responses.fetch_add(1, Ordering::Relaxed);
        Ok(resp)
    }

    async fn on_exception(
        &self,
        _err: &crate::error::CrawlError,
        _req: &Request,
    ) -> Result<Option<Response>, MiddlewareError> {
        self.errors.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_agent_middleware_sets_header() {
        let mw = UserAgentMiddleware::new("TestBot/1.0");
        let req = Request::get("http://h/");
        let outcome = mw.on_request(req).await.unwrap();
        match outcome {
            RequestOutcome::Continue(req) => {
                assert_eq!(req.headers.get("User-Agent").map(String::as_str), Some("TestBot/1.0"));
            }
            RequestOutcome::ShortCircuit(_) => panic!("should not short-circuit"),
        }
    }

    #[tokio::test]
    async fn stats_middleware_counts_each_phase() {
        let mw = StatsMiddleware::new();
        let req = Request::get("http://h/");
        mw.on_request(req.clone()).await.unwrap();
        mw.on_response(
            Response {
                status: 200,
                headers: Default::default(),
                body: Vec::new(),
                url: req.url.clone(),
            },
            &req,
        )
        .await
        .unwrap();
        let err = crate::error::CrawlError::Timeout {
            url: Some(req.url.clone()),
            elapsed_ms: 5_000,
        };
        mw.on_exception(&err, &req).await.unwrap();

        assert_eq!(mw.snapshot(), (1, 1, 1));
    }
}
