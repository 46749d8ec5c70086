//! C9: Worker Pool — `max_concurrent_workers` tasks each looping
//! dequeue -> rate limit -> robots -> middleware -> fetch -> extract ->
//! enqueue links -> emit. See spec §4.8. The teacher's crawler recurses
//! per-link; this generalizes that into an iterative loop over a shared
//! scheduler so depth is bounded by the queue, not the call stack.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mime::Mime;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::CrawlerConfig;
use crate::error::CrawlError;
use crate::extractor::PageExtractor;
use crate::health::HealthTracker;
use crate::http_client::{HttpClient, HttpClientError};
use crate::middleware::{self, Middleware, RequestOutcome};
use crate::rate_limiter::RateLimiter;
use crate::robots::RobotsGate;
use crate::scheduler::Scheduler;
use crate::sink::Sink;
use crate::types::{CrawlTask, PageResult, Request};
use crate::url_filter::{fingerprint_at_depth, should_follow};

/// Everything a worker needs, shared read-only (beyond the internally
/// synchronized components) across the whole pool.
pub struct WorkerContext {
    pub scheduler: Arc<Scheduler>,
    pub rate_limiter: Arc<RateLimiter>,
    pub robots: Arc<RobotsGate>,
    pub http_client: Arc<dyn HttpClient>,
    pub extractor: Arc<dyn PageExtractor>,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub sink: Arc<dyn Sink>,
    pub config: Arc<CrawlerConfig>,
    pub health: Arc<HealthTracker>,
    pub pages_crawled: Arc<AtomicU64>,
    /// Requests dequeued but not yet fully processed — used by the
    /// orchestrator to tell "queue empty" apart from "queue empty and
    /// everyone idle".
    pub in_flight: Arc<AtomicU64>,
    /// Mirrors the orchestrator's shutdown/cancellation flag. `worker_loop`
    /// already races this against `dequeue`; `process_task` also checks it
    /// at the rate-acquire and post-fetch boundaries so a cancelled crawl
    /// stops between I/O steps rather than only between queue items.
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

/// Spawns `max_concurrent_workers` tasks and returns their join handles. Each
/// worker runs until `shutdown` fires or the scheduler has been empty with no
/// other worker active for long enough that the orchestrator decides to stop
/// the pool (signalled via the same `shutdown` channel).
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let count = ctx.config.max_concurrent_workers.max(1);
    (0..count)
        .map(|id| {
            let ctx = ctx.clone();
            let mut shutdown = shutdown.clone();
            ctx.health.register(id);
            tokio::spawn(async move {
                worker_loop(id, ctx.clone(), &mut shutdown).await;
                ctx.health.deregister(id);
            })
        })
        .collect()
}

async fn worker_loop(id: usize, ctx: Arc<WorkerContext>, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        if let Some(max_pages) = ctx.config.max_pages {
            if ctx.pages_crawled.load(Ordering::SeqCst) >= max_pages {
                return;
            }
        }

        let request = tokio::select! {
            result = ctx.scheduler.dequeue() => result,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        let priority_request = match request {
            Ok(r) => r,
            Err(err) => {
                error!(?err, "scheduler dequeue failed");
                return;
            }
        };

        if *shutdown.borrow() {
            return;
        }

        ctx.health.heartbeat(id);
        ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = process_task(&ctx, priority_request.task).await;
        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = outcome {
            if err.is_per_url() {
                warn!(?err, "per-url crawl error");
            } else {
                error!(?err, "fatal crawl error, stopping worker");
                return;
            }
        }
    }
}

async fn process_task(ctx: &WorkerContext, task: CrawlTask) -> Result<(), CrawlError> {
    let Ok(parsed) = Url::parse(&task.url) else {
        return Ok(());
    };
    let Some(host) = parsed.host_str().map(str::to_string) else {
        return Ok(());
    };

    let robots = ctx.robots.check(&task.url).await;
    if let Some(err) = &robots.fetch_error {
        // Advisory only: the gate already decided to allow by default, so
        // this just gives the exception middlewares (logging/stats) the
        // same visibility into a robots.txt failure they'd get for any
        // other per-URL error. The recovery result, if any, is discarded.
        let probe = Request::get(task.url.clone());
        let _ = middleware::process_exception(err, &probe, &ctx.middlewares).await;
    }
    if !robots.allowed {
        debug!(url = %task.url, "blocked by robots.txt");
        return Ok(());
    }
    if let Some(delay) = robots.crawl_delay {
        ctx.rate_limiter.ensure_min_spacing(&host, delay).await;
    }

    ctx.rate_limiter.acquire_domain(&host).await;
    let _permit = ctx.rate_limiter.acquire_global().await;

    // Cancellation boundary: a permit was just acquired but no request has
    // gone out yet. `_permit` drops (and is released) on this early return.
    if *ctx.shutdown.borrow() {
        return Ok(());
    }

    let mut request = Request::get(task.url.clone());
    request.timeout_ms = Some(ctx.config.fetch_timeout_ms);
    request.depth = task.depth;

    let request_snapshot = request.clone();
    let request = match middleware::process_request(request, &ctx.middlewares).await? {
        RequestOutcome::Continue(req) => req,
        RequestOutcome::ShortCircuit(resp) => {
            return handle_response(ctx, &task, resp, &request_snapshot).await;
        }
    };

    let fetch_result = ctx.http_client.fetch(request.clone()).await;
    let response = match fetch_result {
        Ok(resp) => resp,
        Err(HttpClientError::Timeout { url, timeout_ms }) => {
            let crawl_err = CrawlError::Timeout {
                url: Some(url),
                elapsed_ms: timeout_ms,
            };
            return recover_or_propagate(ctx, &task, &request, crawl_err).await;
        }
        Err(HttpClientError::Transport { url, source }) => {
            let crawl_err = CrawlError::Network {
                url: Some(url),
                source: anyhow::Error::new(source),
            };
            return recover_or_propagate(ctx, &task, &request, crawl_err).await;
        }
    };

    // Cancellation boundary: the fetch already happened (can't be undone),
    // but a cancelled crawl stops short of enqueuing discovered links or
    // emitting to the sink — per-cancel, pending state reflects the
    // pre-cancel queue.
    if *ctx.shutdown.borrow() {
        return Ok(());
    }

    handle_response(ctx, &task, response, &request).await
}

/// Sniffs `body`'s actual content type (never the `Content-Type` header,
/// which a server can get wrong) and checks it against `config`'s allow
/// list. Returns the offending MIME string when the page should be
/// rejected; `None` when it's allowed, including when the allow list is
/// empty or the type can't be determined.
fn disallowed_content_type(config: &CrawlerConfig, body: &[u8]) -> Option<String> {
    if config.allowed_content_types.is_empty() {
        return None;
    }
    let Some(kind) = infer::get(body) else {
        return None;
    };
    let Ok(mime) = Mime::from_str(kind.mime_type()) else {
        return None;
    };
    if config.allowed_content_types.contains(&mime) {
        None
    } else {
        Some(mime.to_string())
    }
}

async fn recover_or_propagate(
    ctx: &WorkerContext,
    _task: &CrawlTask,
    request: &Request,
    err: CrawlError,
) -> Result<(), CrawlError> {
    match middleware::process_exception(&err, request, &ctx.middlewares).await? {
        Some(_recovered) => Ok(()),
        None => Err(err),
    }
}

async fn handle_response(
    ctx: &WorkerContext,
    task: &CrawlTask,
    response: crate::types::Response,
    request: &Request,
) -> Result<(), CrawlError> {
    let response = middleware::process_response(response, request, &ctx.middlewares).await?;

    if response.status >= 400 {
        let err = CrawlError::Response {
            url: Some(task.url.clone()),
            reason: format!("status {}", response.status),
        };
        return recover_or_propagate(ctx, task, request, err).await;
    }

    if let Some(sniffed) = disallowed_content_type(&ctx.config, &response.body) {
        let err = CrawlError::ContentType {
            url: Some(task.url.clone()),
            content_type: Some(sniffed),
        };
        return recover_or_propagate(ctx, task, request, err).await;
    }

    let html = String::from_utf8_lossy(&response.body).to_string();
    let started = std::time::Instant::now();
    let mut page_data = ctx.extractor.extract_page_data(&task.url, &html, response.status, &response.headers);
    page_data.depth = task.depth;
    page_data.scrape_duration_ms = started.elapsed().as_millis() as u64;

    let within_depth = ctx.config.max_depth.map_or(true, |max| task.depth < max);
    let extracted = if within_depth {
        ctx.extractor.extract_links(&task.url, &html, ctx.config.respect_no_follow)
    } else {
        crate::extractor::ExtractedLinks::default()
    };

    for link in &extracted.links {
        let decision = should_follow(&ctx.config, link, Some(&task.url));
        if !decision.follow {
            if let Some(fingerprint) = fingerprint_at_depth(link, task.depth + 1) {
                ctx.scheduler.mark_visited(&fingerprint).await?;
            }
            continue;
        }
        let next_task = CrawlTask {
            url: link.clone(),
            depth: task.depth + 1,
            from_url: Some(task.url.clone()),
        };
        ctx.scheduler.enqueue(next_task, 0).await?;
    }

    ctx.pages_crawled.fetch_add(1, Ordering::SeqCst);

    let result = PageResult {
        page_data,
        depth: task.depth,
        extracted_links: extracted.links,
    };
    ctx.sink.emit(result).await
}
