//! C11: Crawl Orchestrator — owns the lifecycle of one crawl run: builds the
//! collaborators, optionally restores prior state, seeds the queue, runs the
//! worker pool and health monitor to completion, and reports a summary. See
//! spec §4.10. Generalizes the teacher's `Crawler::start` (a single
//! recursive call over one root URL) into a multi-seed, worker-pool driven
//! run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::CrawlerConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::extractor::{PageExtractor, ScraperLinkExtractor};
use crate::health::{HealthMonitor, HealthTracker};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::middleware::Middleware;
use crate::persistence::auto_strategy;
use crate::rate_limiter::RateLimiter;
use crate::robots::{RobotsGate, RobotsParser, RobotstxtParser};
use crate::scheduler::Scheduler;
use crate::sink::Sink;
use crate::storage::StorageBackend;
use crate::types::{CrawlTask, StateKey};
use crate::url_filter::should_follow;
use crate::worker::{spawn_workers, WorkerContext};

/// Outcome of a completed (or externally stopped) crawl run.
#[derive(Debug, Clone, Copy)]
pub struct CrawlSummary {
    pub pages_crawled: u64,
    pub elapsed_ms: u64,
    /// `false` if the run stopped because `max_pages` was hit or
    /// [`Crawler::cancel`] was called mid-run, rather than because the
    /// queue drained naturally.
    pub completed: bool,
}

/// How often the orchestrator polls for queue-empty-and-idle before
/// declaring the crawl finished.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Builds and runs one crawl. Owns the collaborator stack; a fresh
/// [`Scheduler`] is created per run (or restored from `backend`, when
/// resumability is enabled).
pub struct Crawler {
    config: Arc<CrawlerConfig>,
    http_client: Arc<dyn HttpClient>,
    extractor: Arc<dyn PageExtractor>,
    robots_parser: Arc<dyn RobotsParser>,
    middlewares: Vec<Arc<dyn Middleware>>,
    backend: Option<Arc<dyn StorageBackend>>,
    /// The currently running crawl's shutdown sender, if any, so
    /// [`Crawler::cancel`] can reach it. `std::sync::Mutex` rather than
    /// `tokio::sync::Mutex`: it's only ever held across a plain assignment,
    /// never across an `.await`.
    cancellation: std::sync::Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

/// Clears `crawler.cancellation` when the crawl it belongs to ends, on every
/// exit path (including an early `?` return), so a later `crawl()` call on
/// the same `Crawler` doesn't inherit a stale sender from the previous run.
struct CancellationGuard<'a> {
    crawler: &'a Crawler,
}

impl Drop for CancellationGuard<'_> {
    fn drop(&mut self) {
        *self.crawler.cancellation.lock().unwrap() = None;
    }
}

impl Crawler {
    pub fn new(config: CrawlerConfig) -> CrawlResult<Self> {
        let http_client = ReqwestHttpClient::new(
            &config.user_agent,
            config.follow_redirects,
            Duration::from_millis(config.fetch_timeout_ms),
        )
        .map_err(|e| CrawlError::configuration(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            http_client: Arc::new(http_client),
            extractor: Arc::new(ScraperLinkExtractor),
            robots_parser: Arc::new(RobotstxtParser),
            middlewares: Vec::new(),
            backend: None,
            cancellation: std::sync::Mutex::new(None),
        })
    }

    /// Requests cancellation of the crawl currently running on this
    /// orchestrator, if any; a no-op otherwise. Per spec §4.10/§5: fans out
    /// to every worker, each of which checks for cancellation between I/O
    /// boundaries (after dequeue, after acquiring a rate-limit permit, after
    /// fetching) rather than mid-request. Any permit already acquired is
    /// released through ordinary `Drop`, not specially here — cancellation
    /// never leaks one. The resulting [`CrawlSummary::completed`] is `false`.
    pub fn cancel(&self) {
        if let Some(tx) = self.cancellation.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = client;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// A [`StateKey`] carries a freshly generated id, so resuming across
    /// process restarts means first finding the id a prior run already
    /// registered under the same `session_name` — a bare `StateKey::new`
    /// would always miss (different id, nothing on disk under it). Falls
    /// back to a new key when the backend can't list sessions, or when none
    /// match.
    async fn find_or_create_session_key(&self, backend: &Arc<dyn StorageBackend>, session_name: &str) -> StateKey {
        if let Ok(sessions) = backend.list_sessions().await {
            if let Some(existing) = sessions.into_iter().find(|s| s.name == session_name) {
                return existing;
            }
        }
        StateKey::new(session_name)
    }

    /// Runs a crawl from `seeds` to completion, streaming every fetched page
    /// to `sink`. `session_name` identifies the resumable state when
    /// `enable_resumability` is set; it is otherwise unused.
    pub async fn crawl(
        &self,
        seeds: Vec<String>,
        session_name: &str,
        sink: Arc<dyn Sink>,
    ) -> CrawlResult<CrawlSummary> {
        let started = Instant::now();
        let scheduler = Arc::new(Scheduler::new());

        if self.config.enable_resumability {
            let backend = self.backend.clone().ok_or_else(|| {
                CrawlError::configuration("enable_resumability requires a configured storage backend")
            })?;
            let strategy = Arc::from(auto_strategy(backend.clone()));
            let key = self.find_or_create_session_key(&backend, session_name).await;
            backend.ensure_session(&key).await?;
            let restored = scheduler.restore(strategy, key).await?;
            if restored {
                info!(session = session_name, "resumed prior crawl state");
            }
        }

        for seed in seeds {
            let decision = should_follow(&self.config, &seed, None);
            if !decision.follow {
                info!(url = %seed, reason = ?decision.reason, "seed skipped");
                continue;
            }
            scheduler.enqueue(CrawlTask::seed(seed), i64::MAX).await?;
        }

        let robots = Arc::new(RobotsGate::new(
            self.http_client.clone(),
            self.robots_parser.clone(),
            self.config.user_agent.clone(),
            self.config.ignore_robots_txt,
            self.config.max_robots_crawl_delay_ms,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.max_concurrent_requests,
            self.config.max_requests_per_second_per_domain,
            self.config.request_delay_ms,
        ));
        let health = Arc::new(HealthTracker::new());
        let pages_crawled = Arc::new(AtomicU64::new(0));
        let in_flight = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        *self.cancellation.lock().unwrap() = Some(shutdown_tx.clone());
        let _cancellation_guard = CancellationGuard { crawler: self };

        let ctx = Arc::new(WorkerContext {
            scheduler: scheduler.clone(),
            rate_limiter,
            robots,
            http_client: self.http_client.clone(),
            extractor: self.extractor.clone(),
            middlewares: self.middlewares.clone(),
            sink,
            config: self.config.clone(),
            health: health.clone(),
            pages_crawled: pages_crawled.clone(),
            in_flight: in_flight.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let monitor = HealthMonitor::new(
            health,
            Duration::from_secs(self.config.health_scan_interval_secs),
            Duration::from_secs(self.config.stuck_threshold_secs),
        );
        let monitor_shutdown = shutdown_rx.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        let workers = spawn_workers(ctx, shutdown_rx.clone());

        let mut cancel_watch = shutdown_rx.clone();
        let mut completed = true;
        loop {
            if *cancel_watch.borrow() {
                completed = false;
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                _ = cancel_watch.changed() => {
                    if *cancel_watch.borrow() {
                        completed = false;
                        break;
                    }
                    continue;
                }
            }
            let queue_empty = scheduler.is_empty().await;
            let nothing_in_flight = in_flight.load(Ordering::SeqCst) == 0;
            let hit_page_cap = self
                .config
                .max_pages
                .is_some_and(|max| pages_crawled.load(Ordering::SeqCst) >= max);
            if hit_page_cap {
                completed = false;
                break;
            }
            if queue_empty && nothing_in_flight {
                break;
            }
        }

        let _ = shutdown_tx.send(true);
        for handle in workers {
            let _ = handle.await;
        }
        let _ = monitor_handle.await;

        if self.config.enable_resumability {
            scheduler.flush_persistence().await?;
        }

        Ok(CrawlSummary {
            pages_crawled: pages_crawled.load(Ordering::SeqCst),
            elapsed_ms: started.elapsed().as_millis() as u64,
            completed,
        })
    }
}
