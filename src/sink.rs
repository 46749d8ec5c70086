//! Consumer-facing output contract. A [`Sink`] receives one [`PageResult`]
//! per successfully crawled page; backpressure is whatever `emit` does
//! (block, buffer, drop) since the orchestrator awaits it before dequeuing
//! the next request.

use async_trait::async_trait;

use crate::error::CrawlResult;
use crate::types::PageResult;

#[async_trait]
pub trait Sink: Send + Sync {
    async fn emit(&self, result: PageResult) -> CrawlResult<()>;
}

/// Buffers every result in memory; mainly useful for tests and small
/// one-shot crawls.
pub struct CollectingSink {
    results: tokio::sync::Mutex<Vec<PageResult>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            results: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn into_results(self) -> Vec<PageResult> {
        self.results.into_inner()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    async fn emit(&self, result: PageResult) -> CrawlResult<()> {
        self.results.lock().await.push(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageData;
    use std::collections::HashMap;

    fn sample() -> PageResult {
        PageResult {
            page_data: PageData {
                url: "https://h/".to_string(),
                html: String::new(),
                title: None,
                metadata: HashMap::new(),
                common_metadata: None,
                status_code: 200,
                headers: HashMap::new(),
                fetched_at: chrono::Utc::now(),
                scrape_duration_ms: 0,
                depth: 0,
                extracted_data: None,
            },
            depth: 0,
            extracted_links: vec![],
        }
    }

    #[tokio::test]
    async fn collecting_sink_accumulates_results() {
        let sink = CollectingSink::new();
        sink.emit(sample()).await.unwrap();
        sink.emit(sample()).await.unwrap();
        assert_eq!(sink.into_results().await.len(), 2);
    }
}
