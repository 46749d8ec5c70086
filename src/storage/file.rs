//! Reference file-based [`StorageBackend`]. Writes JSON under
//! `<root>/<sessionId>/{meta.json, state.json, snapshots/<seq>.json,
//! deltas/<seq>.json}`, each write atomic via temp-file + rename, matching
//! the normative layout in spec §6.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::PersistenceError;
use crate::types::{SchedulerState, StateDelta, StateKey};

use super::{Capabilities, Latency, Snapshot, StorageBackend};

#[derive(Debug, Serialize, Deserialize)]
struct SessionMeta {
    id: String,
    name: String,
    created_at_iso: String,
}

/// JSON-on-disk storage backend. Every write goes to `<file>.tmp` first and
/// is then renamed into place so a crash never leaves a half-written file.
pub struct FileStorageBackend {
    root: PathBuf,
}

impl FileStorageBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, key: &StateKey) -> PathBuf {
        self.root.join(&key.id)
    }

    fn state_path(&self, key: &StateKey) -> PathBuf {
        self.session_dir(key).join("state.json")
    }

    fn meta_path(&self, key: &StateKey) -> PathBuf {
        self.session_dir(key).join("meta.json")
    }

    fn deltas_dir(&self, key: &StateKey) -> PathBuf {
        self.session_dir(key).join("deltas")
    }

    fn snapshots_dir(&self, key: &StateKey) -> PathBuf {
        self.session_dir(key).join("snapshots")
    }

    async fn write_atomic(path: &Path, contents: &[u8], op: &str) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::new(op, None, e))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)
            .await
            .map_err(|e| PersistenceError::new(op, None, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| PersistenceError::new(op, None, e))?;
        Ok(())
    }

    async fn ensure_session(&self, key: &StateKey) -> Result<(), PersistenceError> {
        let meta = SessionMeta {
            id: key.id.clone(),
            name: key.name.clone(),
            created_at_iso: key.created_at.to_rfc3339(),
        };
        let bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| PersistenceError::new("ensure_session", Some(key.id.clone()), e))?;
        let path = self.meta_path(key);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            Self::write_atomic(&path, &bytes, "ensure_session").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileStorageBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_delta: true,
            supports_snapshot: true,
            supports_streaming: false,
            supports_concurrency: false,
            latency: Latency::Medium,
        }
    }

    async fn initialize(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PersistenceError::new("initialize", None, e))
    }

    async fn save_state(&self, key: &StateKey, state: &SchedulerState) -> Result<(), PersistenceError> {
        self.ensure_session(key).await?;
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| PersistenceError::new("save_state", Some(key.id.clone()), e))?;
        Self::write_atomic(&self.state_path(key), &bytes, "save_state").await
    }

    async fn load_state(&self, key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError> {
        let path = self.state_path(key);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PersistenceError::new("load_state", Some(key.id.clone()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::new("load_state", Some(key.id.clone()), e)),
        }
    }

    async fn delete_state(&self, key: &StateKey) -> Result<(), PersistenceError> {
        let path = self.state_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::new("delete_state", Some(key.id.clone()), e)),
        }
    }

    async fn save_delta(&self, delta: &StateDelta) -> Result<(), PersistenceError> {
        let key = StateKey {
            id: delta.state_key.clone(),
            name: String::new(),
            created_at: delta.timestamp,
        };
        self.ensure_session(&key).await?;
        let bytes = serde_json::to_vec_pretty(delta)
            .map_err(|e| PersistenceError::new("save_delta", Some(delta.state_key.clone()), e))?;
        let path = self.deltas_dir(&key).join(format!("{:020}.json", delta.sequence));
        Self::write_atomic(&path, &bytes, "save_delta").await
    }

    async fn load_deltas(
        &self,
        key: &StateKey,
        from_sequence: Option<u64>,
    ) -> Result<Vec<StateDelta>, PersistenceError> {
        let dir = self.deltas_dir(key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::new("load_deltas", Some(key.id.clone()), e)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::new("load_deltas", Some(key.id.clone()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|e| PersistenceError::new("load_deltas", Some(key.id.clone()), e))?;
            let delta: StateDelta = serde_json::from_slice(&bytes)
                .map_err(|e| PersistenceError::new("load_deltas", Some(key.id.clone()), e))?;
            if from_sequence.map_or(true, |from| delta.sequence >= from) {
                out.push(delta);
            }
        }
        out.sort_by_key(|d| d.sequence);
        Ok(out)
    }

    async fn save_snapshot(
        &self,
        key: &StateKey,
        state: &SchedulerState,
        sequence: u64,
    ) -> Result<(), PersistenceError> {
        self.ensure_session(key).await?;
        let snapshot = Snapshot {
            state: state.clone(),
            sequence,
        };
        #[derive(Serialize)]
        struct OnDisk<'a> {
            sequence: u64,
            state: &'a SchedulerState,
        }
        let bytes = serde_json::to_vec_pretty(&OnDisk {
            sequence: snapshot.sequence,
            state: &snapshot.state,
        })
        .map_err(|e| PersistenceError::new("save_snapshot", Some(key.id.clone()), e))?;
        let path = self.snapshots_dir(key).join(format!("{:020}.json", sequence));
        Self::write_atomic(&path, &bytes, "save_snapshot").await
    }

    async fn load_latest_snapshot(&self, key: &StateKey) -> Result<Option<Snapshot>, PersistenceError> {
        let dir = self.snapshots_dir(key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::new("load_latest_snapshot", Some(key.id.clone()), e)),
        };

        let mut latest: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::new("load_latest_snapshot", Some(key.id.clone()), e))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(seq) = stem.parse::<u64>() else {
                continue;
            };
            if latest.as_ref().map_or(true, |(best, _)| seq > *best) {
                latest = Some((seq, path));
            }
        }

        let Some((sequence, path)) = latest else {
            return Ok(None);
        };
        let bytes = fs::read(&path)
            .await
            .map_err(|e| PersistenceError::new("load_latest_snapshot", Some(key.id.clone()), e))?;

        #[derive(Deserialize)]
        struct OnDisk {
            sequence: u64,
            state: SchedulerState,
        }
        let on_disk: OnDisk = serde_json::from_slice(&bytes)
            .map_err(|e| PersistenceError::new("load_latest_snapshot", Some(key.id.clone()), e))?;
        debug_assert_eq!(on_disk.sequence, sequence);
        Ok(Some(Snapshot {
            state: on_disk.state,
            sequence: on_disk.sequence,
        }))
    }

    async fn compact_deltas(&self, key: &StateKey, before_sequence: u64) -> Result<(), PersistenceError> {
        let dir = self.deltas_dir(key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PersistenceError::new("compact_deltas", Some(key.id.clone()), e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::new("compact_deltas", Some(key.id.clone()), e))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(seq) = stem.parse::<u64>() else {
                continue;
            };
            if seq < before_sequence {
                let _ = fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    async fn ensure_session(&self, key: &StateKey) -> Result<(), PersistenceError> {
        self.ensure_session(key).await
    }

    async fn list_sessions(&self) -> Result<Vec<StateKey>, PersistenceError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::new("list_sessions", None, e)),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::new("list_sessions", None, e))?
        {
            let meta_path = entry.path().join("meta.json");
            if let Ok(bytes) = fs::read(&meta_path).await {
                if let Ok(meta) = serde_json::from_slice::<SessionMeta>(&bytes) {
                    let created_at = chrono::DateTime::parse_from_rfc3339(&meta.created_at_iso)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now());
                    out.push(StateKey {
                        id: meta.id,
                        name: meta.name,
                        created_at,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeltaOp, PriorityRequest};

    fn sample_request(seq: u64) -> PriorityRequest {
        PriorityRequest {
            task: crate::types::CrawlTask::seed("http://h/"),
            priority: 0,
            created_at: chrono::Utc::now(),
            fingerprint: "http://h/:0".to_string(),
            sequence: seq,
        }
    }

    #[tokio::test]
    async fn save_and_load_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        backend.initialize().await.unwrap();

        let key = StateKey::new("session-a");
        let mut state = SchedulerState::default();
        state.pending_requests.push(sample_request(0));
        state.visited_fingerprints.insert("http://h/:0".to_string());
        state.total_processed = 1;

        backend.save_state(&key, &state).await.unwrap();
        let loaded = backend.load_state(&key).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn load_state_for_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let key = StateKey::new("nope");
        assert!(backend.load_state(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deltas_round_trip_sorted_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let key = StateKey::new("session-b");

        for seq in [2u64, 0, 1] {
            let delta = StateDelta {
                state_key: key.id.clone(),
                sequence: seq,
                timestamp: chrono::Utc::now(),
                op: DeltaOp::MarkVisited(format!("fp-{seq}")),
            };
            backend.save_delta(&delta).await.unwrap();
        }

        let loaded = backend.load_deltas(&key, None).await.unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|d| d.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn load_deltas_respects_from_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let key = StateKey::new("session-c");
        for seq in 0u64..5 {
            let delta = StateDelta {
                state_key: key.id.clone(),
                sequence: seq,
                timestamp: chrono::Utc::now(),
                op: DeltaOp::MarkVisited(format!("fp-{seq}")),
            };
            backend.save_delta(&delta).await.unwrap();
        }
        let loaded = backend.load_deltas(&key, Some(3)).await.unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|d| d.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn snapshot_round_trips_and_latest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let key = StateKey::new("session-d");

        let mut state1 = SchedulerState::default();
        state1.total_processed = 1;
        backend.save_snapshot(&key, &state1, 3).await.unwrap();

        let mut state2 = SchedulerState::default();
        state2.total_processed = 2;
        backend.save_snapshot(&key, &state2, 6).await.unwrap();

        let latest = backend.load_latest_snapshot(&key).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 6);
        assert_eq!(latest.state.total_processed, 2);
    }

    #[tokio::test]
    async fn compact_deltas_removes_only_superseded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let key = StateKey::new("session-e");
        for seq in 0u64..4 {
            let delta = StateDelta {
                state_key: key.id.clone(),
                sequence: seq,
                timestamp: chrono::Utc::now(),
                op: DeltaOp::MarkVisited(format!("fp-{seq}")),
            };
            backend.save_delta(&delta).await.unwrap();
        }
        backend.compact_deltas(&key, 2).await.unwrap();
        let remaining = backend.load_deltas(&key, None).await.unwrap();
        let seqs: Vec<u64> = remaining.iter().map(|d| d.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
