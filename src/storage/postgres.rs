//! Reference SQL [`StorageBackend`] on top of `sqlx`'s Postgres driver,
//! implementing the `spider_sessions` / `spider_deltas` / `spider_snapshots`
//! schema from spec §4.2. Delete order is snapshots -> deltas -> sessions to
//! respect the foreign keys below.
//!
//! ```sql
//! create table spider_sessions (
//!     id text primary key,
//!     name text not null,
//!     created_at timestamptz not null
//! );
//! create table spider_deltas (
//!     session_id text not null references spider_sessions(id),
//!     sequence bigint not null,
//!     timestamp timestamptz not null,
//!     op jsonb not null,
//!     unique (session_id, sequence)
//! );
//! create table spider_snapshots (
//!     session_id text not null references spider_sessions(id),
//!     sequence bigint not null,
//!     state jsonb not null,
//!     unique (session_id, sequence)
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::PersistenceError;
use crate::types::{DeltaOp, SchedulerState, StateDelta, StateKey};

use super::{Capabilities, Latency, Snapshot, StorageBackend};

pub struct PostgresStorageBackend {
    pool: PgPool,
}

impl PostgresStorageBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn err(op: &str, key: Option<&str>, e: sqlx::Error) -> PersistenceError {
        PersistenceError::new(op, key.map(|k| k.to_string()), e)
    }

    async fn upsert_session(&self, key: &StateKey) -> Result<(), PersistenceError> {
        sqlx::query(
            "insert into spider_sessions (id, name, created_at) values ($1, $2, $3) \
             on conflict (id) do nothing",
        )
        .bind(&key.id)
        .bind(&key.name)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("ensure_session", Some(&key.id), e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PostgresStorageBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_delta: true,
            supports_snapshot: true,
            supports_streaming: true,
            supports_concurrency: true,
            latency: Latency::High,
        }
    }

    async fn initialize(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            "create table if not exists spider_sessions (\
               id text primary key, name text not null, created_at timestamptz not null)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("initialize", None, e))?;

        sqlx::query(
            "create table if not exists spider_deltas (\
               session_id text not null references spider_sessions(id), \
               sequence bigint not null, timestamp timestamptz not null, op jsonb not null, \
               unique (session_id, sequence))",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("initialize", None, e))?;

        sqlx::query(
            "create table if not exists spider_snapshots (\
               session_id text not null references spider_sessions(id), \
               sequence bigint not null, state jsonb not null, \
               unique (session_id, sequence))",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("initialize", None, e))?;

        Ok(())
    }

    async fn save_state(&self, key: &StateKey, state: &SchedulerState) -> Result<(), PersistenceError> {
        // FullState strategy on a delta-capable backend: persist as a
        // sequence-0 snapshot so load_state/save_state stay coherent with
        // load_latest_snapshot.
        self.save_snapshot(key, state, 0).await
    }

    async fn load_state(&self, key: &StateKey) -> Result<Option<SchedulerState>, PersistenceError> {
        Ok(self
            .load_latest_snapshot(key)
            .await?
            .map(|snapshot| snapshot.state))
    }

    async fn delete_state(&self, key: &StateKey) -> Result<(), PersistenceError> {
        sqlx::query("delete from spider_snapshots where session_id = $1")
            .bind(&key.id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err("delete_state", Some(&key.id), e))?;
        sqlx::query("delete from spider_deltas where session_id = $1")
            .bind(&key.id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err("delete_state", Some(&key.id), e))?;
        sqlx::query("delete from spider_sessions where id = $1")
            .bind(&key.id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err("delete_state", Some(&key.id), e))?;
        Ok(())
    }

    async fn save_delta(&self, delta: &StateDelta) -> Result<(), PersistenceError> {
        sqlx::query(
            "insert into spider_sessions (id, name, created_at) values ($1, $1, now()) \
             on conflict (id) do nothing",
        )
        .bind(&delta.state_key)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("save_delta", Some(&delta.state_key), e))?;

        let op_json = serde_json::to_value(&delta.op)
            .map_err(|e| PersistenceError::new("save_delta", Some(delta.state_key.clone()), e))?;

        sqlx::query(
            "insert into spider_deltas (session_id, sequence, timestamp, op) values ($1, $2, $3, $4) \
             on conflict (session_id, sequence) do update set op = excluded.op",
        )
        .bind(&delta.state_key)
        .bind(delta.sequence as i64)
        .bind(delta.timestamp)
        .bind(op_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("save_delta", Some(&delta.state_key), e))?;
        Ok(())
    }

    async fn load_deltas(
        &self,
        key: &StateKey,
        from_sequence: Option<u64>,
    ) -> Result<Vec<StateDelta>, PersistenceError> {
        let rows = sqlx::query(
            "select sequence, timestamp, op from spider_deltas \
             where session_id = $1 and sequence >= $2 order by sequence asc",
        )
        .bind(&key.id)
        .bind(from_sequence.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::err("load_deltas", Some(&key.id), e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let sequence: i64 = row.try_get("sequence").map_err(|e| Self::err("load_deltas", Some(&key.id), e))?;
            let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(|e| Self::err("load_deltas", Some(&key.id), e))?;
            let op_json: serde_json::Value = row.try_get("op").map_err(|e| Self::err("load_deltas", Some(&key.id), e))?;
            let op: DeltaOp = serde_json::from_value(op_json)
                .map_err(|e| PersistenceError::new("load_deltas", Some(key.id.clone()), e))?;
            out.push(StateDelta {
                state_key: key.id.clone(),
                sequence: sequence as u64,
                timestamp,
                op,
            });
        }
        Ok(out)
    }

    async fn save_snapshot(
        &self,
        key: &StateKey,
        state: &SchedulerState,
        sequence: u64,
    ) -> Result<(), PersistenceError> {
        self.upsert_session(key).await?;

        let state_json = serde_json::to_value(state)
            .map_err(|e| PersistenceError::new("save_snapshot", Some(key.id.clone()), e))?;

        sqlx::query(
            "insert into spider_snapshots (session_id, sequence, state) values ($1, $2, $3) \
             on conflict (session_id, sequence) do update set state = excluded.state",
        )
        .bind(&key.id)
        .bind(sequence as i64)
        .bind(state_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("save_snapshot", Some(&key.id), e))?;
        Ok(())
    }

    async fn load_latest_snapshot(&self, key: &StateKey) -> Result<Option<Snapshot>, PersistenceError> {
        let row = sqlx::query(
            "select sequence, state from spider_snapshots where session_id = $1 \
             order by sequence desc limit 1",
        )
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::err("load_latest_snapshot", Some(&key.id), e))?;

        let Some(row) = row else { return Ok(None) };
        let sequence: i64 = row.try_get("sequence").map_err(|e| Self::err("load_latest_snapshot", Some(&key.id), e))?;
        let state_json: serde_json::Value = row.try_get("state").map_err(|e| Self::err("load_latest_snapshot", Some(&key.id), e))?;
        let state: SchedulerState = serde_json::from_value(state_json)
            .map_err(|e| PersistenceError::new("load_latest_snapshot", Some(key.id.clone()), e))?;
        Ok(Some(Snapshot {
            state,
            sequence: sequence as u64,
        }))
    }

    async fn compact_deltas(&self, key: &StateKey, before_sequence: u64) -> Result<(), PersistenceError> {
        sqlx::query("delete from spider_deltas where session_id = $1 and sequence < $2")
            .bind(&key.id)
            .bind(before_sequence as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err("compact_deltas", Some(&key.id), e))?;
        Ok(())
    }

    async fn ensure_session(&self, key: &StateKey) -> Result<(), PersistenceError> {
        self.upsert_session(key).await
    }

    async fn list_sessions(&self) -> Result<Vec<StateKey>, PersistenceError> {
        let rows = sqlx::query("select id, name, created_at from spider_sessions order by created_at asc")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::err("list_sessions", None, e))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StateKey {
                id: row.try_get("id").map_err(|e| Self::err("list_sessions", None, e))?,
                name: row.try_get("name").map_err(|e| Self::err("list_sessions", None, e))?,
                created_at: row.try_get("created_at").map_err(|e| Self::err("list_sessions", None, e))?,
            });
        }
        Ok(out)
    }
}
