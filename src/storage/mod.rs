//! C3: Storage Backend — a capability-advertising persistence interface.
//! See spec §4.2. Concrete backends live in [`file`] and, behind the
//! `postgres` feature, [`postgres`].

pub mod file;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::types::{SchedulerState, StateDelta, StateKey};

/// Latency tier a backend advertises, used by callers (e.g. the `auto`
/// persistence-strategy selector) to reason about cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    Low,
    Medium,
    High,
}

/// What a concrete backend supports. Every optional operation is gated by
/// one of these flags; calling an unsupported operation is itself a
/// [`PersistenceError`], never a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_delta: bool,
    pub supports_snapshot: bool,
    pub supports_streaming: bool,
    pub supports_concurrency: bool,
    pub latency: Latency,
}

/// A named, versioned scheduler-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: SchedulerState,
    pub sequence: u64,
}

/// Opaque persistence primitives: snapshots, deltas, sessions. A concrete
/// backend implements whatever subset its `capabilities()` advertises;
/// everything else returns `PersistenceError::unsupported(..)`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn initialize(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn save_state(
        &self,
        _key: &StateKey,
        _state: &SchedulerState,
    ) -> Result<(), PersistenceError> {
        Err(PersistenceError::unsupported("save_state"))
    }

    async fn load_state(&self, _key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError> {
        Err(PersistenceError::unsupported("load_state"))
    }

    async fn delete_state(&self, _key: &StateKey) -> Result<(), PersistenceError> {
        Err(PersistenceError::unsupported("delete_state"))
    }

    async fn save_delta(&self, _delta: &StateDelta) -> Result<(), PersistenceError> {
        Err(PersistenceError::unsupported("save_delta"))
    }

    async fn save_deltas(&self, deltas: &[StateDelta]) -> Result<(), PersistenceError> {
        for d in deltas {
            self.save_delta(d).await?;
        }
        Ok(())
    }

    async fn load_deltas(
        &self,
        _key: &StateKey,
        _from_sequence: Option<u64>,
    ) -> Result<Vec<StateDelta>, PersistenceError> {
        Err(PersistenceError::unsupported("load_deltas"))
    }

    async fn save_snapshot(
        &self,
        _key: &StateKey,
        _state: &SchedulerState,
        _sequence: u64,
    ) -> Result<(), PersistenceError> {
        Err(PersistenceError::unsupported("save_snapshot"))
    }

    async fn load_latest_snapshot(&self, _key: &StateKey) -> Result<Option<Snapshot>, PersistenceError> {
        Err(PersistenceError::unsupported("load_latest_snapshot"))
    }

    async fn compact_deltas(&self, _key: &StateKey, _before_sequence: u64) -> Result<(), PersistenceError> {
        Err(PersistenceError::unsupported("compact_deltas"))
    }

    async fn list_sessions(&self) -> Result<Vec<StateKey>, PersistenceError> {
        Err(PersistenceError::unsupported("list_sessions"))
    }

    /// Registers `key`'s id/name/created_at up front, independent of any
    /// delta or snapshot write. A [`StateDelta`] only carries the session
    /// id, so a backend that lazily created the session row from the first
    /// delta alone would never learn its name; callers that care about
    /// resuming by name must call this before the first `persist`. Default
    /// no-op for backends with no session registry of their own.
    async fn ensure_session(&self, _key: &StateKey) -> Result<(), PersistenceError> {
        Ok(())
    }
}
