//! C5: Scheduler — priority queue of requests, fingerprint seen-set, and
//! state snapshots. See spec §4.4.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::{CrawlError, CrawlResult};
use crate::persistence::PersistenceStrategy;
use crate::types::{CrawlTask, DeltaOp, PriorityRequest, SchedulerState, StateDelta, StateKey, StateOperation};
use crate::url_filter::fingerprint_at_depth;

struct Inner {
    pending: BinaryHeap<PriorityRequest>,
    seen: HashSet<String>,
    total_processed: u64,
}

struct PersistenceHandle {
    strategy: Arc<dyn PersistenceStrategy>,
    key: StateKey,
}

/// Owns the pending queue and the seen-set exclusively; mutation is
/// serialized through a single internal lock (single-writer discipline) so
/// the seen-set is race-free even with many concurrent workers.
pub struct Scheduler {
    inner: Mutex<Inner>,
    notify: Notify,
    sequence: AtomicU64,
    delta_sequence: AtomicU64,
    persistence: Mutex<Option<PersistenceHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: BinaryHeap::new(),
                seen: HashSet::new(),
                total_processed: 0,
            }),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            delta_sequence: AtomicU64::new(0),
            persistence: Mutex::new(None),
        }
    }

    pub async fn configure_persistence(&self, strategy: Arc<dyn PersistenceStrategy>, key: StateKey) {
        *self.persistence.lock().await = Some(PersistenceHandle { strategy, key });
    }

    pub async fn clear_persistence(&self) {
        *self.persistence.lock().await = None;
    }

    fn snapshot_locked(inner: &Inner) -> SchedulerState {
        SchedulerState {
            pending_requests: inner.pending.clone().into_sorted_vec(),
            visited_fingerprints: inner.seen.clone(),
            total_processed: inner.total_processed,
        }
    }

    async fn emit_delta(&self, op: DeltaOp, resulting_state: SchedulerState) -> CrawlResult<()> {
        let guard = self.persistence.lock().await;
        let Some(handle) = guard.as_ref() else {
            return Ok(());
        };
        let sequence = self.delta_sequence.fetch_add(1, Ordering::SeqCst);
        let delta = StateDelta {
            state_key: handle.key.id.clone(),
            sequence,
            timestamp: chrono::Utc::now(),
            op,
        };
        let state_op = StateOperation {
            delta,
            resulting_state,
            should_snapshot: false,
        };
        handle.strategy.persist(&handle.key, state_op).await?;
        Ok(())
    }

    /// Computes the fingerprint, checks the seen-set, and — if new —
    /// inserts into the seen-set, pushes the request, and emits an
    /// `Enqueue` delta. Mutation order: (1) in-memory state, (2) delta,
    /// (3) return; a persistence error is surfaced but the in-memory change
    /// is already observable.
    pub async fn enqueue(&self, task: CrawlTask, priority: i64) -> CrawlResult<bool> {
        let Some(fingerprint) = fingerprint_at_depth(&task.url, task.depth) else {
            return Err(CrawlError::Validation {
                reason: format!("cannot fingerprint URL {}", task.url),
            });
        };

        let (inserted, resulting_state) = {
            let mut inner = self.inner.lock().await;
            if inner.seen.contains(&fingerprint) {
                (false, None)
            } else {
                inner.seen.insert(fingerprint.clone());
                let request = PriorityRequest {
                    task,
                    priority,
                    created_at: chrono::Utc::now(),
                    fingerprint: fingerprint.clone(),
                    sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                };
                inner.pending.push(request.clone());
                let state = Self::snapshot_locked(&inner);
                (true, Some((request, state)))
            }
        };

        if let Some((request, state)) = resulting_state {
            self.notify.notify_one();
            self.emit_delta(DeltaOp::Enqueue(request), state).await?;
        }

        Ok(inserted)
    }

    /// Blocks until the queue is non-empty, then removes and returns the
    /// highest-priority request (FIFO within equal priority).
    pub async fn dequeue(&self) -> CrawlResult<PriorityRequest> {
        loop {
            let (request, resulting_state) = {
                let mut inner = self.inner.lock().await;
                match inner.pending.pop() {
                    Some(request) => {
                        inner.total_processed += 1;
                        let state = Self::snapshot_locked(&inner);
                        (Some(request), state)
                    }
                    None => (None, Self::snapshot_locked(&inner)),
                }
            };

            if let Some(request) = request {
                self.emit_delta(DeltaOp::Dequeue(request.fingerprint.clone()), resulting_state)
                    .await?;
                return Ok(request);
            }

            self.notify.notified().await;
        }
    }

    /// Records a fingerprint as visited without dequeuing (used by workers
    /// for links that were filtered before ever being enqueued, so repeats
    /// are still recognized).
    pub async fn mark_visited(&self, fingerprint: &str) -> CrawlResult<()> {
        let (newly, state) = {
            let mut inner = self.inner.lock().await;
            let newly = inner.seen.insert(fingerprint.to_string());
            (newly, Self::snapshot_locked(&inner))
        };
        if newly {
            self.emit_delta(DeltaOp::MarkVisited(fingerprint.to_string()), state)
                .await?;
        }
        Ok(())
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    pub async fn total_processed(&self) -> u64 {
        self.inner.lock().await.total_processed
    }

    /// Requires a configured state key; otherwise a [`CrawlError::Configuration`].
    pub async fn get_state(&self) -> CrawlResult<SchedulerState> {
        let guard = self.persistence.lock().await;
        if guard.is_none() {
            return Err(CrawlError::configuration(
                "get_state called without a configured persistence key",
            ));
        }
        let inner = self.inner.lock().await;
        Ok(Self::snapshot_locked(&inner))
    }

    /// Atomically replaces the in-memory state.
    pub async fn restore_from_state(&self, state: SchedulerState) {
        let mut inner = self.inner.lock().await;
        inner.pending = BinaryHeap::from(state.pending_requests);
        inner.seen = state.visited_fingerprints;
        inner.total_processed = state.total_processed;
        let max_sequence = inner.pending.iter().map(|r| r.sequence).max().unwrap_or(0);
        drop(inner);
        self.sequence.fetch_max(max_sequence + 1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Flushes any state the configured persistence strategy is holding only
    /// in memory (e.g. a batched hybrid delta buffer) out to its backend.
    /// No-op without a configured persistence key.
    pub async fn flush_persistence(&self) -> CrawlResult<()> {
        let guard = self.persistence.lock().await;
        if let Some(handle) = guard.as_ref() {
            handle.strategy.flush(&handle.key).await?;
        }
        Ok(())
    }

    /// Restores from a backend via the given strategy; returns `false` if no
    /// prior state exists.
    pub async fn restore(&self, strategy: Arc<dyn PersistenceStrategy>, key: StateKey) -> CrawlResult<bool> {
        let next_sequence = strategy.next_sequence(&key).await?;
        self.delta_sequence.fetch_max(next_sequence, Ordering::SeqCst);

        match strategy.restore(&key).await? {
            Some(state) => {
                self.restore_from_state(state).await;
                self.configure_persistence(strategy, key).await;
                Ok(true)
            }
            None => {
                self.configure_persistence(strategy, key).await;
                Ok(false)
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::FullStateStrategy;
    use crate::storage::file::FileStorageBackend;

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let scheduler = Scheduler::new();
        assert!(scheduler.enqueue(CrawlTask::seed("http://h/a"), 0).await.unwrap());
        assert!(!scheduler.enqueue(CrawlTask::seed("http://h/a"), 0).await.unwrap());
        assert_eq!(scheduler.size().await, 1);
    }

    #[tokio::test]
    async fn same_url_different_depth_is_not_deduplicated() {
        let scheduler = Scheduler::new();
        let mut task = CrawlTask::seed("http://h/a");
        assert!(scheduler.enqueue(task.clone(), 0).await.unwrap());
        task.depth = 1;
        assert!(scheduler.enqueue(task, 0).await.unwrap());
        assert_eq!(scheduler.size().await, 2);
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first_ties_are_fifo() {
        let scheduler = Scheduler::new();
        scheduler.enqueue(CrawlTask::seed("http://h/low"), 0).await.unwrap();
        scheduler.enqueue(CrawlTask::seed("http://h/high"), 5).await.unwrap();
        scheduler.enqueue(CrawlTask::seed("http://h/low2"), 0).await.unwrap();

        let first = scheduler.dequeue().await.unwrap();
        assert_eq!(first.task.url, "http://h/high");
        let second = scheduler.dequeue().await.unwrap();
        assert_eq!(second.task.url, "http://h/low");
        let third = scheduler.dequeue().await.unwrap();
        assert_eq!(third.task.url, "http://h/low2");
    }

    #[tokio::test]
    async fn total_processed_tracks_dequeues() {
        let scheduler = Scheduler::new();
        scheduler.enqueue(CrawlTask::seed("http://h/a"), 0).await.unwrap();
        scheduler.enqueue(CrawlTask::seed("http://h/b"), 0).await.unwrap();
        scheduler.dequeue().await.unwrap();
        assert_eq!(scheduler.total_processed().await, 1);
    }

    #[tokio::test]
    async fn get_state_without_persistence_key_is_configuration_error() {
        let scheduler = Scheduler::new();
        let err = scheduler.get_state().await.unwrap_err();
        assert!(matches!(err, CrawlError::Configuration { .. }));
    }

    #[tokio::test]
    async fn restore_after_crash_preserves_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        backend.initialize().await.unwrap();
        let strategy: Arc<dyn PersistenceStrategy> = Arc::new(FullStateStrategy::new(backend));
        let key = StateKey::new("resume-test");

        let scheduler = Scheduler::new();
        scheduler.configure_persistence(strategy.clone(), key.clone()).await;
        scheduler.enqueue(CrawlTask::seed("http://h/a"), 0).await.unwrap();
        scheduler.enqueue(CrawlTask::seed("http://h/b"), 0).await.unwrap();
        scheduler.enqueue(CrawlTask::seed("http://h/c"), 0).await.unwrap();
        scheduler.dequeue().await.unwrap(); // dequeues "a"

        // "Crash": drop and build a fresh scheduler, restore from storage.
        let fresh = Scheduler::new();
        let restored = fresh.restore(strategy, key).await.unwrap();
        assert!(restored);

        let next = fresh.dequeue().await.unwrap();
        assert_eq!(next.task.url, "http://h/b");
        let next = fresh.dequeue().await.unwrap();
        assert_eq!(next.task.url, "http://h/c");
    }

    #[tokio::test]
    async fn restore_from_absent_state_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        let strategy: Arc<dyn PersistenceStrategy> = Arc::new(FullStateStrategy::new(backend));
        let scheduler = Scheduler::new();
        let restored = scheduler.restore(strategy, StateKey::new("missing")).await.unwrap();
        assert!(!restored);
    }
}
