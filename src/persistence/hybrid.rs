use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::HybridPersistenceConfig;
use crate::error::PersistenceError;
use crate::storage::StorageBackend;
use crate::types::{SchedulerState, StateDelta, StateKey, StateOperation};

use super::{apply_delta, PersistenceStrategy};

struct HybridInner {
    counter: u64,
    last_snapshot_sequence: u64,
    pending: Vec<StateDelta>,
}

/// Keeps an in-memory counter and `last_snapshot_sequence`; snapshots on the
/// configured interval (or when the scheduler asks for one), otherwise
/// writes (or batches) individual deltas. See spec §4.3.
pub struct HybridStrategy {
    backend: Arc<dyn StorageBackend>,
    config: HybridPersistenceConfig,
    inner: Mutex<HybridInner>,
}

impl HybridStrategy {
    pub fn new(backend: Arc<dyn StorageBackend>, config: HybridPersistenceConfig) -> Self {
        Self {
            backend,
            config,
            inner: Mutex::new(HybridInner {
                counter: 0,
                last_snapshot_sequence: 0,
                pending: Vec::new(),
            }),
        }
    }

    async fn flush_pending(&self, inner: &mut HybridInner) -> Result<(), PersistenceError> {
        if inner.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut inner.pending);
        match self.backend.save_deltas(&batch).await {
            Ok(()) => Ok(()),
            Err(_) => {
                for delta in &batch {
                    self.backend.save_delta(delta).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PersistenceStrategy for HybridStrategy {
    async fn persist(&self, key: &StateKey, op: StateOperation) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        inner.counter += 1;

        if self.config.batch_deltas {
            inner.pending.push(op.delta.clone());
        }

        let should_snapshot = op.should_snapshot
            || inner.counter % self.config.snapshot_interval == 0
            || inner.counter - inner.last_snapshot_sequence >= self.config.max_deltas_before_snapshot;

        if should_snapshot {
            self.backend
                .save_snapshot(key, &op.resulting_state, op.delta.sequence)
                .await?;
            inner.last_snapshot_sequence = op.delta.sequence;
            if self.config.compaction_enabled {
                self.backend.compact_deltas(key, op.delta.sequence).await?;
            }
            inner.pending.clear();
        } else if !self.config.batch_deltas {
            self.backend.save_delta(&op.delta).await?;
        } else if inner.pending.len() >= self.config.delta_batch_size {
            self.flush_pending(&mut inner).await?;
        }

        Ok(())
    }

    async fn restore(&self, key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError> {
        let snapshot = self.backend.load_latest_snapshot(key).await?;
        let (mut state, from_sequence) = match &snapshot {
            Some(s) => (s.state.clone(), Some(s.sequence + 1)),
            None => (SchedulerState::default(), None),
        };

        let mut deltas = self.backend.load_deltas(key, from_sequence).await?;
        if snapshot.is_none() && deltas.is_empty() {
            return Ok(None);
        }
        deltas.sort_by_key(|d| d.sequence);
        for delta in &deltas {
            apply_delta(&mut state, delta);
        }

        // The snapshot already folds in everything before its own sequence;
        // any delta file still sitting below that point is stale (e.g. a
        // crash before a prior compaction ran). Sweep it now rather than
        // leave it to accumulate across repeated restores.
        if let Some(s) = &snapshot {
            let _ = self.backend.compact_deltas(key, s.sequence).await;
        }

        Ok(Some(state))
    }

    async fn cleanup(&self, key: &StateKey) -> Result<(), PersistenceError> {
        {
            let mut inner = self.inner.lock().await;
            self.flush_pending(&mut inner).await?;
        }
        let _ = self.backend.delete_state(key).await;
        self.backend.compact_deltas(key, u64::MAX).await
    }

    async fn flush(&self, _key: &StateKey) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        self.flush_pending(&mut inner).await
    }

    async fn next_sequence(&self, key: &StateKey) -> Result<u64, PersistenceError> {
        let snapshot = self.backend.load_latest_snapshot(key).await?;
        let from_sequence = snapshot.as_ref().map(|s| s.sequence + 1);
        let deltas = self.backend.load_deltas(key, from_sequence).await?;
        let max_delta = deltas.iter().map(|d| d.sequence).max();
        Ok(match (snapshot.map(|s| s.sequence), max_delta) {
            (None, None) => 0,
            (Some(s), None) => s + 1,
            (None, Some(d)) => d + 1,
            (Some(s), Some(d)) => s.max(d) + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageBackend;
    use crate::types::{CrawlTask, DeltaOp, PriorityRequest};

    fn request(seq: u64) -> PriorityRequest {
        PriorityRequest {
            task: CrawlTask::seed(format!("http://h/{seq}")),
            priority: 0,
            created_at: chrono::Utc::now(),
            fingerprint: format!("http://h/{seq}:0"),
            sequence: seq,
        }
    }

    fn enqueue_op(
        key: &StateKey,
        seq: u64,
        state: &mut SchedulerState,
        should_snapshot: bool,
    ) -> StateOperation {
        let req = request(seq);
        state.pending_requests.push(req.clone());
        state.total_processed = seq;
        let delta = StateDelta {
            state_key: key.id.clone(),
            sequence: seq,
            timestamp: chrono::Utc::now(),
            op: DeltaOp::Enqueue(req),
        };
        StateOperation {
            delta,
            resulting_state: state.clone(),
            should_snapshot,
        }
    }

    #[tokio::test]
    async fn snapshots_at_configured_interval() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        let config = HybridPersistenceConfig {
            snapshot_interval: 3,
            max_deltas_before_snapshot: 500,
            compaction_enabled: true,
            batch_deltas: true,
            delta_batch_size: 10,
        };
        let strategy = HybridStrategy::new(backend.clone(), config);
        let key = StateKey::new("hybrid");

        let mut state = SchedulerState::default();
        for seq in 1u64..=7 {
            let op = enqueue_op(&key, seq, &mut state, false);
            strategy.persist(&key, op).await.unwrap();
        }

        // Snapshots should exist at sequence 3 and 6.
        let latest = backend.load_latest_snapshot(&key).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 6);
    }

    #[tokio::test]
    async fn restore_equals_full_delta_replay() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        let config = HybridPersistenceConfig {
            snapshot_interval: 3,
            ..HybridPersistenceConfig::default()
        };
        let strategy = HybridStrategy::new(backend, config);
        let key = StateKey::new("hybrid-2");

        let mut state = SchedulerState::default();
        let mut expected = SchedulerState::default();
        for seq in 1u64..=7 {
            let op = enqueue_op(&key, seq, &mut state, false);
            apply_delta(&mut expected, &op.delta);
            strategy.persist(&key, op).await.unwrap();
        }

        let restored = strategy.restore(&key).await.unwrap().unwrap();
        assert_eq!(restored.pending_requests.len(), expected.pending_requests.len());
        assert_eq!(restored.total_processed, expected.total_processed);
    }
}
