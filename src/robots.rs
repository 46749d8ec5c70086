//! C8: Robots Gate — per-domain robots.txt cache and allow/disallow
//! decision. See spec §4.7. Generalizes the teacher's inline
//! fetch-cache-sleep pattern into a TTL'd cache with no inline sleeping —
//! spacing is the rate limiter's job (spec §4.7).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CrawlError;
use crate::http_client::HttpClient;
use crate::types::RobotsDirective;

/// Collaborator contract: given raw robots.txt text and a user-agent,
/// return the parsed directives.
pub trait RobotsParser: Send + Sync {
    fn parse(&self, content: &str, user_agent: &str) -> RobotsDirective;
    fn is_allowed(&self, content: &str, user_agent: &str, url: &str) -> bool;
}

/// Default adapter over the `robotstxt` crate (the teacher's own robots
/// stack).
pub struct RobotstxtParser;

impl RobotsParser for RobotstxtParser {
    fn parse(&self, content: &str, _user_agent: &str) -> RobotsDirective {
        let mut allowed = Vec::new();
        let mut disallowed = Vec::new();
        let mut crawl_delay_ms = None;

        for line in content.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Allow:").or_else(|| line.strip_prefix("allow:")) {
                allowed.push(rest.trim().to_string());
            } else if let Some(rest) = line
                .strip_prefix("Disallow:")
                .or_else(|| line.strip_prefix("disallow:"))
            {
                disallowed.push(rest.trim().to_string());
            } else if let Some(rest) = line
                .strip_prefix("Crawl-delay:")
                .or_else(|| line.strip_prefix("crawl-delay:"))
            {
                if let Ok(secs) = rest.trim().parse::<f64>() {
                    crawl_delay_ms = Some((secs * 1000.0) as u64);
                }
            }
        }

        RobotsDirective {
            allowed_paths: allowed,
            disallowed_paths: disallowed,
            crawl_delay_ms,
        }
    }

    fn is_allowed(&self, content: &str, user_agent: &str, url: &str) -> bool {
        robotstxt::DefaultMatcher::default().one_agent_allowed_by_robots(content, user_agent, url)
    }
}

struct CacheEntry {
    content: String,
    directive: RobotsDirective,
    fetched_at: Instant,
}

/// Per-domain cache of parsed robots.txt, with a TTL and an
/// `ignore_robots_txt` override.
pub struct RobotsGate {
    http_client: Arc<dyn HttpClient>,
    parser: Arc<dyn RobotsParser>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
    ignore_robots_txt: bool,
    max_crawl_delay_ms: u64,
    user_agent: String,
}

impl RobotsGate {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        parser: Arc<dyn RobotsParser>,
        user_agent: impl Into<String>,
        ignore_robots_txt: bool,
        max_crawl_delay_ms: u64,
    ) -> Self {
        Self {
            http_client,
            parser,
            cache: DashMap::new(),
            ttl: Duration::from_secs(3600),
            ignore_robots_txt,
            max_crawl_delay_ms,
            user_agent: user_agent.into(),
        }
    }

    async fn fetch_and_cache(&self, scheme: &str, host: &str) -> Result<(String, RobotsDirective), CrawlError> {
        let robots_url = format!("{scheme}://{host}/robots.txt");
        let fetch = self
            .http_client
            .fetch(crate::types::Request::get(robots_url))
            .await;

        let content = match fetch {
            Ok(resp) if resp.status < 400 => String::from_utf8_lossy(&resp.body).to_string(),
            Ok(resp) => {
                return Err(CrawlError::RobotsTxt {
                    domain: host.to_string(),
                    reason: format!("robots.txt responded with status {}", resp.status),
                });
            }
            Err(err) => {
                return Err(CrawlError::RobotsTxt {
                    domain: host.to_string(),
                    reason: err.to_string(),
                });
            }
        };
        let directive = self.parser.parse(&content, &self.user_agent);
        self.cache.insert(
            host.to_string(),
            CacheEntry {
                content: content.clone(),
                directive: directive.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok((content, directive))
    }

    /// Returns whether `url` may be fetched, the clamped crawl-delay (if
    /// any) to apply as the minimum inter-request spacing for the host, and
    /// — when robots.txt itself couldn't be fetched — the error behind the
    /// allow-by-default decision, so the caller can still surface it (e.g.
    /// through the exception middleware chain) without that fetch failure
    /// changing the decision itself.
    pub async fn check(&self, url: &str) -> RobotsCheckOutcome {
        if self.ignore_robots_txt {
            return RobotsCheckOutcome::allow();
        }

        let Ok(parsed) = url::Url::parse(url) else {
            return RobotsCheckOutcome::allow();
        };
        let Some(host) = parsed.host_str() else {
            return RobotsCheckOutcome::allow();
        };
        let scheme = parsed.scheme();

        let cached = self
            .cache
            .get(host)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| (entry.content.clone(), entry.directive.clone()));

        let (content, directive, fetch_error) = match cached {
            Some((content, directive)) => (content, directive, None),
            None => match self.fetch_and_cache(scheme, host).await {
                Ok((content, directive)) => (content, directive, None),
                Err(err) => {
                    tracing::warn!(domain = %host, error = %err, "robots.txt fetch failed, allowing by default");
                    return RobotsCheckOutcome {
                        allowed: true,
                        crawl_delay: None,
                        fetch_error: Some(err),
                    };
                }
            },
        };

        let allowed = self.parser.is_allowed(&content, &self.user_agent, url);
        let crawl_delay = directive
            .crawl_delay_ms
            .map(|ms| Duration::from_millis(ms.min(self.max_crawl_delay_ms)));
        RobotsCheckOutcome {
            allowed,
            crawl_delay,
            fetch_error,
        }
    }
}

/// Outcome of [`RobotsGate::check`].
#[derive(Debug)]
pub struct RobotsCheckOutcome {
    pub allowed: bool,
    pub crawl_delay: Option<Duration>,
    pub fetch_error: Option<CrawlError>,
}

impl RobotsCheckOutcome {
    fn allow() -> Self {
        Self {
            allowed: true,
            crawl_delay: None,
            fetch_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpClient, HttpClientError};
    use crate::types::{Request, Response};

    struct MockHttpClient {
        robots_body: String,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn fetch(&self, req: Request) -> Result<Response, HttpClientError> {
            Ok(Response {
                status: 200,
                headers: Default::default(),
                body: self.robots_body.clone().into_bytes(),
                url: req.url,
            })
        }
    }

    #[tokio::test]
    async fn crawl_delay_is_parsed_and_clamped() {
        let client = Arc::new(MockHttpClient {
            robots_body: "User-agent: *\nDisallow: /admin\nCrawl-delay: 120".to_string(),
        });
        let gate = RobotsGate::new(client, Arc::new(RobotstxtParser), "TestBot", false, 30_000);

        let outcome = gate.check("http://h/page").await;
        assert!(outcome.allowed);
        assert_eq!(outcome.crawl_delay, Some(Duration::from_millis(30_000)));
    }

    #[tokio::test]
    async fn disallowed_path_is_blocked() {
        let client = Arc::new(MockHttpClient {
            robots_body: "User-agent: *\nDisallow: /admin".to_string(),
        });
        let gate = RobotsGate::new(client, Arc::new(RobotstxtParser), "TestBot", false, 30_000);
        let outcome = gate.check("http://h/admin/panel").await;
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn ignore_robots_txt_always_allows() {
        let client = Arc::new(MockHttpClient {
            robots_body: "User-agent: *\nDisallow: /".to_string(),
        });
        let gate = RobotsGate::new(client, Arc::new(RobotstxtParser), "TestBot", true, 30_000);
        let outcome = gate.check("http://h/anything").await;
        assert!(outcome.allowed);
    }

    struct FailingHttpClient;

    #[async_trait]
    impl HttpClient for FailingHttpClient {
        async fn fetch(&self, req: Request) -> Result<Response, HttpClientError> {
            Err(HttpClientError::Timeout {
                url: req.url,
                timeout_ms: 5_000,
            })
        }
    }

    #[tokio::test]
    async fn unreachable_robots_txt_allows_by_default_but_reports_the_error() {
        let gate = RobotsGate::new(Arc::new(FailingHttpClient), Arc::new(RobotstxtParser), "TestBot", false, 30_000);
        let outcome = gate.check("http://h/page").await;
        assert!(outcome.allowed);
        assert!(matches!(outcome.fetch_error, Some(CrawlError::RobotsTxt { .. })));
    }
}
