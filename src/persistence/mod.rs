//! C4: Persistence Strategy — chooses when/what to persist. Three variants
//! share [`PersistenceStrategy`]; see spec §4.3.

mod delta;
mod full_state;
mod hybrid;

pub use delta::DeltaStrategy;
pub use full_state::FullStateStrategy;
pub use hybrid::HybridStrategy;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::storage::{Capabilities, StorageBackend};
use crate::types::{SchedulerState, StateKey, StateOperation};

/// Common interface for the three persistence strategies (§4.3).
#[async_trait]
pub trait PersistenceStrategy: Send + Sync {
    async fn persist(&self, key: &StateKey, op: StateOperation) -> Result<(), PersistenceError>;
    async fn restore(&self, key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError>;
    async fn cleanup(&self, key: &StateKey) -> Result<(), PersistenceError>;

    /// Pushes any state held only in memory (e.g. a batched-but-unflushed
    /// delta buffer) out to the backend. Strategies that write through on
    /// every `persist` call have nothing to do here.
    async fn flush(&self, _key: &StateKey) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// The delta sequence number a freshly-restored scheduler must continue
    /// from, so sequence numbers stay strictly increasing per `StateKey`
    /// across a restore. `FullState` never writes deltas, so 0 is correct
    /// there; `Delta`/`Hybrid` look at what's already on disk.
    async fn next_sequence(&self, _key: &StateKey) -> Result<u64, PersistenceError> {
        Ok(0)
    }
}

/// Fold a single delta onto a state in place, per the rules shared by the
/// Delta and Hybrid restore paths: Enqueue appends, Dequeue removes the
/// first matching-fingerprint request and bumps `total_processed`,
/// MarkVisited adds to the visited set if absent.
pub(crate) fn apply_delta(state: &mut SchedulerState, delta: &crate::types::StateDelta) {
    use crate::types::DeltaOp;
    match &delta.op {
        DeltaOp::Enqueue(request) => {
            // The scheduler inserts into its seen-set in the same step that
            // produces this delta (see `Scheduler::enqueue`), so a pure
            // delta replay must do the same or a resumed crawl would
            // re-fetch everything that was ever dequeued.
            state.visited_fingerprints.insert(request.fingerprint.clone());
            state.pending_requests.push(request.clone());
        }
        DeltaOp::Dequeue(fingerprint) => {
            if let Some(pos) = state
                .pending_requests
                .iter()
                .position(|r| &r.fingerprint == fingerprint)
            {
                state.pending_requests.remove(pos);
                state.total_processed += 1;
            }
        }
        DeltaOp::MarkVisited(fingerprint) => {
            state.visited_fingerprints.insert(fingerprint.clone());
        }
    }
}

/// `auto` backend selection from spec §4.3:
/// `(delta && snapshot) -> Hybrid; delta -> Delta; else FullState`.
pub fn auto_strategy(backend: Arc<dyn StorageBackend>) -> Box<dyn PersistenceStrategy> {
    let caps: Capabilities = backend.capabilities();
    if caps.supports_delta && caps.supports_snapshot {
        Box::new(HybridStrategy::new(backend, Default::default()))
    } else if caps.supports_delta {
        Box::new(DeltaStrategy::new(backend))
    } else {
        Box::new(FullStateStrategy::new(backend))
    }
}
