//! Error taxonomy for the crawl engine.
//!
//! Every fallible operation in this crate returns a typed [`CrawlError`]
//! rather than a raw `anyhow::Error` — consumers need to match on a stable
//! set of kinds (per-URL failures are routed through the middleware's
//! exception phase; scheduler/persistence/configuration errors are fatal).

use std::fmt;

/// A structured, user-visible failure record. Never a raw implementation
/// error — always `{kind, url?, operation?, cause-chain?}`.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("network error fetching {url:?}: {source}")]
    Network {
        url: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("timeout fetching {url:?} after {elapsed_ms}ms")]
    Timeout { url: Option<String>, elapsed_ms: u64 },

    #[error("response error for {url:?}: {reason}")]
    Response { url: Option<String>, reason: String },

    #[error("content-type {content_type:?} not in allowed set for {url:?}")]
    ContentType {
        url: Option<String>,
        content_type: Option<String>,
    },

    #[error("robots.txt error for {domain}: {reason}")]
    RobotsTxt { domain: String, reason: String },

    #[error("parse error for {url:?}: {reason}")]
    Parse { url: Option<String>, reason: String },

    #[error("validation error: {reason}")]
    Validation { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("middleware {middleware_name} failed in {phase:?} phase: {cause}")]
    Middleware {
        phase: MiddlewarePhase,
        middleware_name: String,
        cause: String,
    },

    #[error("persistence error during {operation}: {cause}")]
    Persistence {
        operation: String,
        key: Option<String>,
        cause: String,
    },

    #[error("queue error: {reason}")]
    Queue { reason: String },

    #[error("crawl error: {reason}")]
    Crawl { url: Option<String>, reason: String },
}

/// Which middleware phase raised a [`CrawlError::Middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewarePhase {
    Request,
    Response,
    Error,
}

impl fmt::Display for MiddlewarePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddlewarePhase::Request => write!(f, "request"),
            MiddlewarePhase::Response => write!(f, "response"),
            MiddlewarePhase::Error => write!(f, "error"),
        }
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;

impl CrawlError {
    /// Per-URL errors are routed through the middleware exception chain and,
    /// if unrecovered, surfaced as an error result — the crawl continues.
    /// Everything else is fatal to the running crawl.
    pub fn is_per_url(&self) -> bool {
        matches!(
            self,
            CrawlError::Network { .. }
                | CrawlError::Timeout { .. }
                | CrawlError::Response { .. }
                | CrawlError::ContentType { .. }
                | CrawlError::Parse { .. }
                | CrawlError::RobotsTxt { .. }
                | CrawlError::Crawl { .. }
        )
    }

    pub fn persistence(operation: impl Into<String>, key: Option<String>, cause: impl fmt::Display) -> Self {
        CrawlError::Persistence {
            operation: operation.into(),
            key,
            cause: cause.to_string(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        CrawlError::Configuration {
            reason: reason.into(),
        }
    }
}

/// Error emitted by a storage backend. Missing capability for a requested
/// operation produces this, never a silent no-op.
#[derive(Debug, thiserror::Error)]
#[error("storage backend error during {operation}: {cause}")]
pub struct PersistenceError {
    pub operation: String,
    pub key: Option<String>,
    pub cause: String,
}

impl PersistenceError {
    pub fn new(operation: impl Into<String>, key: Option<String>, cause: impl fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            key,
            cause: cause.to_string(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self {
            cause: format!("backend does not support `{operation}`"),
            operation,
            key: None,
        }
    }
}

impl From<PersistenceError> for CrawlError {
    fn from(e: PersistenceError) -> Self {
        CrawlError::Persistence {
            operation: e.operation,
            key: e.key,
            cause: e.cause,
        }
    }
}

/// Error raised by a middleware hook.
#[derive(Debug, thiserror::Error)]
#[error("middleware `{middleware_name}` failed in {phase} phase: {cause}")]
pub struct MiddlewareError {
    pub phase: MiddlewarePhase,
    pub middleware_name: String,
    pub cause: String,
}

impl From<MiddlewareError> for CrawlError {
    fn from(e: MiddlewareError) -> Self {
        CrawlError::Middleware {
            phase: e.phase,
            middleware_name: e.middleware_name,
            cause: e.cause,
        }
    }
}
