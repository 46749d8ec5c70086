//! End-to-end crawl runs driven entirely by an in-memory fake web, so no
//! network access is needed. Exercises the full orchestrator → worker pool →
//! middleware → scheduler → sink path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use spider::config::CrawlerConfigBuilder;
use spider::http_client::{HttpClient, HttpClientError};
use spider::middleware::builtin::StatsMiddleware;
use spider::orchestrator::Crawler;
use spider::sink::CollectingSink;
use spider::storage::file::FileStorageBackend;
use spider::storage::StorageBackend;
use spider::types::{Request, Response};

/// A fixed set of pages, served from memory. robots.txt is always "allow
/// all" unless a page body is registered for it explicitly.
struct FakeWeb {
    pages: HashMap<String, (u16, String)>,
}

#[async_trait]
impl HttpClient for FakeWeb {
    async fn fetch(&self, request: Request) -> Result<Response, HttpClientError> {
        if request.url.ends_with("/robots.txt") {
            return Ok(Response {
                status: 200,
                headers: HashMap::new(),
                body: b"User-agent: *\n".to_vec(),
                url: request.url,
            });
        }
        match self.pages.get(&request.url) {
            Some((status, body)) => Ok(Response {
                status: *status,
                headers: HashMap::new(),
                body: body.clone().into_bytes(),
                url: request.url,
            }),
            None => Ok(Response {
                status: 404,
                headers: HashMap::new(),
                body: Vec::new(),
                url: request.url,
            }),
        }
    }
}

/// Like [`FakeWeb`], but every non-robots fetch takes `delay` to resolve, so
/// a test can land a cancellation while a fetch is reliably still in flight.
struct SlowFakeWeb {
    pages: HashMap<String, (u16, String)>,
    delay: Duration,
}

#[async_trait]
impl HttpClient for SlowFakeWeb {
    async fn fetch(&self, request: Request) -> Result<Response, HttpClientError> {
        if request.url.ends_with("/robots.txt") {
            return Ok(Response {
                status: 200,
                headers: HashMap::new(),
                body: b"User-agent: *\n".to_vec(),
                url: request.url,
            });
        }
        tokio::time::sleep(self.delay).await;
        match self.pages.get(&request.url) {
            Some((status, body)) => Ok(Response {
                status: *status,
                headers: HashMap::new(),
                body: body.clone().into_bytes(),
                url: request.url,
            }),
            None => Ok(Response {
                status: 404,
                headers: HashMap::new(),
                body: Vec::new(),
                url: request.url,
            }),
        }
    }
}

fn page(links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|l| format!(r#"<a href="{l}">link</a>"#))
        .collect();
    format!("<html><body>{anchors}</body></html>")
}

#[tokio::test]
async fn crawl_follows_links_up_to_configured_depth() {
    let mut pages = HashMap::new();
    pages.insert("https://site.test/".to_string(), (200, page(&["/a", "/b"])));
    pages.insert("https://site.test/a".to_string(), (200, page(&["/deep"])));
    pages.insert("https://site.test/b".to_string(), (200, page(&[])));
    pages.insert("https://site.test/deep".to_string(), (200, page(&["/too-deep"])));
    pages.insert("https://site.test/too-deep".to_string(), (200, page(&[])));

    let config = CrawlerConfigBuilder::new()
        .max_depth(Some(2))
        .max_pages(None)
        .max_concurrent_workers(2)
        .request_delay_ms(0)
        .max_requests_per_second_per_domain(1000.0)
        .build();

    let crawler = Crawler::new(config)
        .unwrap()
        .with_http_client(Arc::new(FakeWeb { pages }));

    let sink = Arc::new(CollectingSink::new());
    let summary = crawler
        .crawl(vec!["https://site.test/".to_string()], "depth-test", sink.clone())
        .await
        .unwrap();

    // "/" (depth 0), "/a" and "/b" (depth 1), "/deep" (depth 2) are crawled;
    // "/too-deep" (depth 3) is discovered but never fetched.
    assert_eq!(summary.pages_crawled, 4);

    let urls: Vec<String> = Arc::try_unwrap(sink)
        .ok()
        .unwrap()
        .into_results()
        .await
        .into_iter()
        .map(|r| r.page_data.url)
        .collect();
    assert!(urls.contains(&"https://site.test/".to_string()));
    assert!(urls.contains(&"https://site.test/deep".to_string()));
    assert!(!urls.contains(&"https://site.test/too-deep".to_string()));
}

#[tokio::test]
async fn blocked_domain_is_never_fetched() {
    let mut pages = HashMap::new();
    pages.insert(
        "https://site.test/".to_string(),
        (200, page(&["https://blocked.test/x"])),
    );
    pages.insert("https://blocked.test/x".to_string(), (200, page(&[])));

    let config = CrawlerConfigBuilder::new()
        .blocked_domains(vec!["blocked.test".to_string()])
        .max_pages(None)
        .build();

    let crawler = Crawler::new(config)
        .unwrap()
        .with_http_client(Arc::new(FakeWeb { pages }));

    let sink = Arc::new(CollectingSink::new());
    let summary = crawler
        .crawl(vec!["https://site.test/".to_string()], "block-test", sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.pages_crawled, 1);
}

#[tokio::test]
async fn stats_middleware_observes_every_request_in_the_run() {
    let mut pages = HashMap::new();
    pages.insert("https://site.test/".to_string(), (200, page(&["/a"])));
    pages.insert("https://site.test/a".to_string(), (200, page(&[])));

    let config = CrawlerConfigBuilder::new().max_pages(None).build();
    let stats = Arc::new(StatsMiddleware::new());

    let crawler = Crawler::new(config)
        .unwrap()
        .with_http_client(Arc::new(FakeWeb { pages }))
        .with_middleware(stats.clone());

    let sink = Arc::new(CollectingSink::new());
    crawler
        .crawl(vec!["https://site.test/".to_string()], "stats-test", sink)
        .await
        .unwrap();

    let (requests, responses, _) = stats.snapshot();
    assert_eq!(requests, 2);
    assert_eq!(responses, 2);
}

#[tokio::test]
async fn resumed_crawl_refetches_nothing_once_already_complete() {
    let mut pages = HashMap::new();
    pages.insert("https://site.test/".to_string(), (200, page(&["/a"])));
    pages.insert("https://site.test/a".to_string(), (200, page(&[])));

    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileStorageBackend::new(dir.path()));
    backend.initialize().await.unwrap();

    let config = CrawlerConfigBuilder::new()
        .max_pages(None)
        .enable_resumability(true)
        .build();

    let crawler = Crawler::new(config)
        .unwrap()
        .with_http_client(Arc::new(FakeWeb { pages: pages.clone() }))
        .with_backend(backend.clone());

    let first_sink = Arc::new(CollectingSink::new());
    let first = crawler
        .crawl(vec!["https://site.test/".to_string()], "resume-session", first_sink)
        .await
        .unwrap();
    assert_eq!(first.pages_crawled, 2);

    let second_sink = Arc::new(CollectingSink::new());
    let second = crawler
        .crawl(vec!["https://site.test/".to_string()], "resume-session", second_sink)
        .await
        .unwrap();
    // Everything is already in the seen-set from the persisted state, so the
    // re-submitted seed is deduplicated and nothing new is fetched.
    assert_eq!(second.pages_crawled, 0);
}

#[tokio::test]
async fn cancelling_a_run_stops_it_short_and_marks_it_incomplete() {
    let mut pages = HashMap::new();
    pages.insert("https://site.test/".to_string(), (200, page(&["/a", "/b", "/c"])));
    pages.insert("https://site.test/a".to_string(), (200, page(&[])));
    pages.insert("https://site.test/b".to_string(), (200, page(&[])));
    pages.insert("https://site.test/c".to_string(), (200, page(&[])));

    let config = CrawlerConfigBuilder::new()
        .max_pages(None)
        .max_concurrent_workers(1)
        .build();

    let crawler = Arc::new(Crawler::new(config).unwrap().with_http_client(Arc::new(SlowFakeWeb {
        pages,
        delay: Duration::from_millis(200),
    })));

    let canceller = crawler.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let sink = Arc::new(CollectingSink::new());
    let summary = crawler
        .crawl(vec!["https://site.test/".to_string()], "cancel-test", sink)
        .await
        .unwrap();

    // Cancelled while the single worker's first fetch was still in flight:
    // that fetch is allowed to finish, but its result is discarded rather
    // than enqueuing links or reaching the sink, and nothing further starts.
    assert!(!summary.completed);
    assert_eq!(summary.pages_crawled, 0);
}
