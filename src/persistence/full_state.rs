use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::storage::StorageBackend;
use crate::types::{SchedulerState, StateKey, StateOperation};

use super::PersistenceStrategy;

/// Each `persist` writes the entire resulting state; `restore` reads it
/// back whole; `cleanup` deletes it. Simplest strategy, highest per-write
/// cost.
pub struct FullStateStrategy {
    backend: Arc<dyn StorageBackend>,
}

impl FullStateStrategy {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PersistenceStrategy for FullStateStrategy {
    async fn persist(&self, key: &StateKey, op: StateOperation) -> Result<(), PersistenceError> {
        self.backend.save_state(key, &op.resulting_state).await
    }

    async fn restore(&self, key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError> {
        self.backend.load_state(key).await
    }

    async fn cleanup(&self, key: &StateKey) -> Result<(), PersistenceError> {
        self.backend.delete_state(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageBackend;
    use crate::types::{CrawlTask, DeltaOp, PriorityRequest, StateDelta};

    fn op_for(state: SchedulerState, delta: StateDelta) -> StateOperation {
        StateOperation {
            delta,
            resulting_state: state,
            should_snapshot: false,
        }
    }

    #[tokio::test]
    async fn persist_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        backend.initialize().await.unwrap();
        let strategy = FullStateStrategy::new(backend);
        let key = StateKey::new("s");

        let mut state = SchedulerState::default();
        state.pending_requests.push(PriorityRequest {
            task: CrawlTask::seed("http://h/"),
            priority: 0,
            created_at: chrono::Utc::now(),
            fingerprint: "http://h/:0".to_string(),
            sequence: 0,
        });
        let delta = StateDelta {
            state_key: key.id.clone(),
            sequence: 0,
            timestamp: chrono::Utc::now(),
            op: DeltaOp::Enqueue(state.pending_requests[0].clone()),
        };

        strategy.persist(&key, op_for(state.clone(), delta)).await.unwrap();
        let restored = strategy.restore(&key).await.unwrap().unwrap();
        assert_eq!(restored, state);
    }

    #[tokio::test]
    async fn restore_absent_state_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileStorageBackend::new(dir.path()));
        let strategy = FullStateStrategy::new(backend);
        let key = StateKey::new("missing");
        assert!(strategy.restore(&key).await.unwrap().is_none());
    }
}
