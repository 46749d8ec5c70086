//! C1: immutable crawler configuration. Generalizes the teacher's
//! `CrawlerConfig`/`CrawlerBuilder` pair to the full surface in spec §6.

use mime::Mime;
use regex::Regex;

const USER_AGENT: &str = "SpiderRustCrawler";
const DEFAULT_MAX_URL_LENGTH: usize = 2083;

/// Which file-extension categories to skip by default.
#[derive(Debug, Clone)]
pub struct FileExtensionFilters {
    pub skip_archives: bool,
    pub skip_images: bool,
    pub skip_audio: bool,
    pub skip_video: bool,
    pub skip_office: bool,
    pub skip_other: bool,
}

impl Default for FileExtensionFilters {
    fn default() -> Self {
        Self {
            skip_archives: true,
            skip_images: true,
            skip_audio: true,
            skip_video: true,
            skip_office: true,
            skip_other: false,
        }
    }
}

const ARCHIVE_EXT: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz"];
const IMAGE_EXT: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "ico", "tiff",
];
const AUDIO_EXT: &[&str] = &["mp3", "wav", "flac", "ogg", "m4a", "aac"];
const VIDEO_EXT: &[&str] = &["mp4", "avi", "mov", "wmv", "flv", "mkv", "webm"];
const OFFICE_EXT: &[&str] = &[
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "pdf", "odt", "ods", "odp",
];
const OTHER_EXT: &[&str] = &["exe", "dmg", "iso", "apk", "msi"];

impl FileExtensionFilters {
    /// Category name + members for each toggle that is on.
    fn categories(&self) -> Vec<(&'static str, &'static [&'static str])> {
        let mut out = Vec::new();
        if self.skip_archives {
            out.push(("archive", ARCHIVE_EXT));
        }
        if self.skip_images {
            out.push(("image", IMAGE_EXT));
        }
        if self.skip_audio {
            out.push(("audio", AUDIO_EXT));
        }
        if self.skip_video {
            out.push(("video", VIDEO_EXT));
        }
        if self.skip_office {
            out.push(("office", OFFICE_EXT));
        }
        if self.skip_other {
            out.push(("other", OTHER_EXT));
        }
        out
    }

    /// Derive the active (extension -> category name) set once, at
    /// configuration time.
    pub fn derive(&self) -> Vec<(String, &'static str)> {
        self.categories()
            .into_iter()
            .flat_map(|(name, exts)| exts.iter().map(move |e| (e.to_string(), name)))
            .collect()
    }
}

/// Technical-filter toggles (malformed URL guard, scheme check, length cap).
#[derive(Debug, Clone)]
pub struct TechnicalFilters {
    pub filter_malformed_urls: bool,
    pub filter_long_urls: bool,
    pub max_url_length: usize,
    pub filter_unsupported_schemes: bool,
}

impl Default for TechnicalFilters {
    fn default() -> Self {
        Self {
            filter_malformed_urls: true,
            filter_long_urls: true,
            max_url_length: DEFAULT_MAX_URL_LENGTH,
            filter_unsupported_schemes: true,
        }
    }
}

/// Hybrid persistence tuning (§4.3).
#[derive(Debug, Clone)]
pub struct HybridPersistenceConfig {
    pub snapshot_interval: u64,
    pub max_deltas_before_snapshot: u64,
    pub compaction_enabled: bool,
    pub batch_deltas: bool,
    pub delta_batch_size: usize,
}

impl Default for HybridPersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 1000,
            max_deltas_before_snapshot: 500,
            compaction_enabled: true,
            batch_deltas: true,
            delta_batch_size: 10,
        }
    }
}

/// Immutable settings shared read-only across an entire crawl. Constructed
/// only via [`CrawlerConfigBuilder`].
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub max_depth: Option<u32>,
    pub max_pages: Option<u64>,
    pub max_concurrent_workers: usize,
    pub max_concurrent_requests: usize,
    pub max_requests_per_second_per_domain: f64,
    pub request_delay_ms: u64,
    pub max_robots_crawl_delay_ms: u64,
    pub ignore_robots_txt: bool,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub allowed_protocols: Vec<String>,
    pub follow_redirects: bool,
    pub respect_no_follow: bool,
    pub restrict_to_start_domain: Option<String>,
    pub file_extension_filters: FileExtensionFilters,
    pub technical_filters: TechnicalFilters,
    pub skip_file_extensions: Option<Vec<String>>,
    pub custom_url_filters: Vec<Regex>,
    /// MIME types a fetched page's sniffed body is allowed to have. Empty
    /// means no restriction. Matched against the content sniffed from the
    /// response body, not the (possibly absent or wrong) `Content-Type`
    /// header.
    pub allowed_content_types: Vec<Mime>,
    pub normalize_urls_for_deduplication: bool,
    pub concurrency: usize,
    pub enable_resumability: bool,
    pub stuck_threshold_secs: u64,
    pub health_scan_interval_secs: u64,
    pub fetch_timeout_ms: u64,
    pub hybrid_persistence: HybridPersistenceConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENT.to_string(),
            max_depth: Some(5),
            max_pages: Some(15),
            max_concurrent_workers: 8,
            max_concurrent_requests: 1_000,
            max_requests_per_second_per_domain: 1.0,
            request_delay_ms: 0,
            max_robots_crawl_delay_ms: 30_000,
            ignore_robots_txt: false,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            allowed_protocols: vec![
                "http".to_string(),
                "https".to_string(),
                "file".to_string(),
                "ftp".to_string(),
            ],
            follow_redirects: true,
            respect_no_follow: true,
            restrict_to_start_domain: None,
            file_extension_filters: FileExtensionFilters::default(),
            technical_filters: TechnicalFilters::default(),
            skip_file_extensions: None,
            custom_url_filters: Vec::new(),
            allowed_content_types: Vec::new(),
            normalize_urls_for_deduplication: true,
            concurrency: 1,
            enable_resumability: false,
            stuck_threshold_secs: 60,
            health_scan_interval_secs: 30,
            fetch_timeout_ms: 30_000,
            hybrid_persistence: HybridPersistenceConfig::default(),
        }
    }
}

impl CrawlerConfig {
    /// The active skip-extension set: a `skip_file_extensions` override
    /// fully replaces the six-category derivation.
    pub fn active_skip_extensions(&self) -> Vec<(String, &'static str)> {
        match &self.skip_file_extensions {
            Some(exts) => exts.iter().map(|e| (e.to_lowercase(), "other")).collect(),
            None => self.file_extension_filters.derive(),
        }
    }
}

/// Builder for [`CrawlerConfig`]. Mirrors the teacher's `CrawlerBuilder`.
#[derive(Debug, Clone)]
pub struct CrawlerConfigBuilder {
    config: CrawlerConfig,
}

impl Default for CrawlerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CrawlerConfig::default(),
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn max_depth(mut self, depth: Option<u32>) -> Self {
        self.config.max_depth = depth;
        self
    }

    pub fn max_pages(mut self, pages: Option<u64>) -> Self {
        self.config.max_pages = pages;
        self
    }

    pub fn max_concurrent_workers(mut self, n: usize) -> Self {
        self.config.max_concurrent_workers = n;
        self
    }

    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.config.max_concurrent_requests = n;
        self
    }

    pub fn max_requests_per_second_per_domain(mut self, rate: f64) -> Self {
        self.config.max_requests_per_second_per_domain = rate;
        self
    }

    pub fn request_delay_ms(mut self, ms: u64) -> Self {
        self.config.request_delay_ms = ms;
        self
    }

    pub fn max_robots_crawl_delay_ms(mut self, ms: u64) -> Self {
        self.config.max_robots_crawl_delay_ms = ms;
        self
    }

    pub fn ignore_robots_txt(mut self, ignore: bool) -> Self {
        self.config.ignore_robots_txt = ignore;
        self
    }

    pub fn allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.config.allowed_domains = domains;
        self
    }

    pub fn blocked_domains(mut self, domains: Vec<String>) -> Self {
        self.config.blocked_domains = domains;
        self
    }

    pub fn allowed_protocols(mut self, protocols: Vec<String>) -> Self {
        self.config.allowed_protocols = protocols;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn respect_no_follow(mut self, respect: bool) -> Self {
        self.config.respect_no_follow = respect;
        self
    }

    pub fn restrict_to_start_domain(mut self, domain: Option<String>) -> Self {
        self.config.restrict_to_start_domain = domain;
        self
    }

    pub fn file_extension_filters(mut self, filters: FileExtensionFilters) -> Self {
        self.config.file_extension_filters = filters;
        self
    }

    pub fn technical_filters(mut self, filters: TechnicalFilters) -> Self {
        self.config.technical_filters = filters;
        self
    }

    pub fn skip_file_extensions(mut self, exts: Option<Vec<String>>) -> Self {
        self.config.skip_file_extensions = exts;
        self
    }

    pub fn custom_url_filters(mut self, filters: Vec<Regex>) -> Self {
        self.config.custom_url_filters = filters;
        self
    }

    /// Restricts crawled pages to the given sniffed MIME types. Empty (the
    /// default) allows everything.
    pub fn allowed_content_types(mut self, mimes: Vec<Mime>) -> Self {
        self.config.allowed_content_types = mimes;
        self
    }

    pub fn normalize_urls_for_deduplication(mut self, normalize: bool) -> Self {
        self.config.normalize_urls_for_deduplication = normalize;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn enable_resumability(mut self, enable: bool) -> Self {
        self.config.enable_resumability = enable;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    pub fn hybrid_persistence(mut self, cfg: HybridPersistenceConfig) -> Self {
        self.config.hybrid_persistence = cfg;
        self
    }

    pub fn build(self) -> CrawlerConfig {
        self.config
    }
}
