//! Core data model shared by every component: tasks, queued requests,
//! scheduler state, persisted deltas, and the page/result types streamed to
//! the consumer. See spec §3.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit of crawl work: a URL at a given depth, optionally carrying the
/// page that linked to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub url: String,
    pub depth: u32,
    pub from_url: Option<String>,
}

impl CrawlTask {
    pub fn seed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            depth: 0,
            from_url: None,
        }
    }
}

/// A queued item: a task plus the scheduling metadata needed to order it.
/// Higher `priority` dequeues first; ties break by insertion order
/// (`sequence`, which doubles as the FIFO tiebreaker for `created_at`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRequest {
    pub task: CrawlTask,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    /// Monotonic insertion counter, used only to break priority ties in
    /// FIFO order; never persisted meaningfully across processes beyond
    /// preserving relative order within a single delta replay.
    pub sequence: u64,
}

impl Ord for PriorityRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PriorityRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Uniquely identifies a resumable scheduler session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateKey {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl StateKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Complete resumable scheduler state. Invariant: every fingerprint of a
/// pending request is present in `visited_fingerprints`; that set only
/// grows within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub pending_requests: Vec<PriorityRequest>,
    pub visited_fingerprints: HashSet<String>,
    pub total_processed: u64,
}

/// A single scheduler-state mutation, persisted as an append-only record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub state_key: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub op: DeltaOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Enqueue(PriorityRequest),
    Dequeue(String),
    MarkVisited(String),
}

/// Passed from the scheduler to the persistence strategy for each mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateOperation {
    pub delta: StateDelta,
    pub resulting_state: SchedulerState,
    pub should_snapshot: bool,
}

/// Per-domain robots.txt directives, cached with a TTL by the robots gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsDirective {
    pub allowed_paths: Vec<String>,
    pub disallowed_paths: Vec<String>,
    pub crawl_delay_ms: Option<u64>,
}

/// Result of one fetch+extract cycle, emitted to the consumer sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub page_data: PageData,
    pub depth: u32,
    pub extracted_links: Vec<String>,
}

/// Parsed page content plus fetch metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageData {
    pub url: String,
    pub html: String,
    pub title: Option<String>,
    pub metadata: HashMap<String, String>,
    pub common_metadata: Option<HashMap<String, String>>,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub scrape_duration_ms: u64,
    pub depth: u32,
    pub extracted_data: Option<serde_json::Value>,
}

/// An outbound HTTP request as it flows through the middleware pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout_ms: Option<u64>,
    pub depth: u32,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout_ms: None,
            depth: 0,
        }
    }
}

/// An inbound HTTP response as it flows through the middleware pipeline.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub url: String,
}
