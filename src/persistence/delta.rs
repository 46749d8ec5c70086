use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::storage::StorageBackend;
use crate::types::{SchedulerState, StateKey, StateOperation};

use super::{apply_delta, PersistenceStrategy};

/// Each `persist` writes one delta. `restore` loads every delta, sorts by
/// `sequence` ascending, and folds them onto an empty state.
pub struct DeltaStrategy {
    backend: Arc<dyn StorageBackend>,
}

impl DeltaStrategy {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PersistenceStrategy for DeltaStrategy {
    async fn persist(&self, _key: &StateKey, op: StateOperation) -> Result<(), PersistenceError> {
        self.backend.save_delta(&op.delta).await
    }

    async fn restore(&self, key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError> {
        let mut deltas = self.backend.load_deltas(key, None).await?;
        if deltas.is_empty() {
            return Ok(None);
        }
        deltas.sort_by_key(|d| d.sequence);

        let mut state = SchedulerState::default();
        for delta in &deltas {
            apply_delta(&mut state, delta);
        }
        Ok(Some(state))
    }

    async fn cleanup(&self, key: &StateKey) -> Result<(), PersistenceError> {
        self.backend.compact_deltas(key, u64::MAX).await
    }

    async fn next_sequence(&self, key: &StateKey) -> Result<u64, PersistenceError> {
        let deltas = self.backend.load_deltas(key, None).await?;
        Ok(deltas.iter().map(|d| d.sequence).max().map_or(0, |m| m + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageBackend;
    use crate::types::{CrawlTask, DeltaOp, PriorityRequest, StateDelta};

    fn request(seq: u64) -> PriorityRequest {
        PriorityRequest {
            task: CrawlTask::seed(format!("http://h/{seq}")),
            priority: 0,
            created_at: chrono::Utc::now(),
            fingerprint: format!("http://h/{seq}:0"),
            sequence: seq,
        }
    }

    #[tokio::test]
    async fn restore_replays_deltas_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        let strategy = DeltaStrategy::new(backend.clone());
        let key = StateKey::new("s");

        let r0 = request(0);
        let r1 = request(1);

        for (seq, op) in [
            (0u64, DeltaOp::Enqueue(r0.clone())),
            (1u64, DeltaOp::Enqueue(r1.clone())),
            (2u64, DeltaOp::MarkVisited(r0.fingerprint.clone())),
            (3u64, DeltaOp::Dequeue(r0.fingerprint.clone())),
        ] {
            let delta = StateDelta {
                state_key: key.id.clone(),
                sequence: seq,
                timestamp: chrono::Utc::now(),
                op,
            };
            let state_op = StateOperation {
                delta: delta.clone(),
                resulting_state: SchedulerState::default(),
                should_snapshot: false,
            };
            strategy.persist(&key, state_op).await.unwrap();
        }

        let restored = strategy.restore(&key).await.unwrap().unwrap();
        assert_eq!(restored.pending_requests.len(), 1);
        assert_eq!(restored.pending_requests[0].fingerprint, r1.fingerprint);
        assert_eq!(restored.total_processed, 1);
        assert!(restored.visited_fingerprints.contains(&r0.fingerprint));
    }

    #[tokio::test]
    async fn restore_with_no_deltas_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        let strategy = DeltaStrategy::new(backend);
        let key = StateKey::new("empty");
        assert!(strategy.restore(&key).await.unwrap().is_none());
    }
}
