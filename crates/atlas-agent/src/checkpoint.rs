use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use atlas_core::error::{AtlasError, Result};
use atlas_core::traits::StateStore;
use atlas_core::types::{RequestId, RunState};

/// Summary row for listing checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub request_id: RequestId,
    pub user_id: Option<String>,
    pub finished: bool,
    pub has_plan: bool,
    pub updated_at: DateTime<Utc>,
}

/// Latest `RunState` per request, backed by SQLite.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| AtlasError::Database(format!("Failed to open checkpoint store: {}", e)))?;
        Self::init(conn)
    }

    /// An in-memory store, for tests and one-shot runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AtlasError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 request_id TEXT PRIMARY KEY,
                 user_id TEXT,
                 state_json TEXT NOT NULL,
                 finished INTEGER NOT NULL DEFAULT 0,
                 has_plan INTEGER NOT NULL DEFAULT 0,
                 updated_at TEXT NOT NULL,
                 updated_ms INTEGER NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_finished
                 ON checkpoints(finished, updated_ms);",
        )
        .map_err(|e| AtlasError::Database(format!("Failed to initialize checkpoint schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AtlasError::Database(e.to_string()))
    }

    /// Replace the snapshot for a request.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (request_id, user_id, state_json, finished, has_plan, updated_at, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(request_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 state_json = excluded.state_json,
                 finished = excluded.finished,
                 has_plan = excluded.has_plan,
                 updated_at = excluded.updated_at,
                 updated_ms = excluded.updated_ms",
            params![
                state.request_id.0,
                state.user_id,
                json,
                state.decision.finished,
                state.plan().is_some(),
                now.to_rfc3339(),
                now.timestamp_millis(),
            ],
        )
        .map_err(|e| AtlasError::Database(format!("Failed to save checkpoint: {}", e)))?;
        Ok(())
    }

    /// Load the snapshot for a request.
    pub fn get(&self, request_id: &RequestId) -> Result<Option<RunState>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM checkpoints WHERE request_id = ?1",
                params![request_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AtlasError::Database(format!("Failed to load checkpoint: {}", e)))?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated checkpoints first.
    pub fn list(&self, limit: usize) -> Result<Vec<CheckpointSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT request_id, user_id, finished, has_plan, updated_at
                 FROM checkpoints
                 ORDER BY updated_ms DESC
                 LIMIT ?1",
            )
            .map_err(|e| AtlasError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let ts: String = row.get(4)?;
                Ok(CheckpointSummary {
                    request_id: RequestId(row.get(0)?),
                    user_id: row.get(1)?,
                    finished: row.get(2)?,
                    has_plan: row.get(3)?,
                    updated_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| AtlasError::Database(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| AtlasError::Database(e.to_string()))?);
        }
        Ok(out)
    }

    pub fn delete(&self, request_id: &RequestId) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM checkpoints WHERE request_id = ?1",
            params![request_id.0],
        )
        .map_err(|e| AtlasError::Database(format!("Failed to delete checkpoint: {}", e)))
    }

    /// Drop finished traversals older than the retention window.
    /// Unfinished ones are kept so they can still be resumed.
    pub fn evict_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE finished = 1 AND updated_ms <= ?1",
                params![cutoff],
            )
            .map_err(|e| AtlasError::Database(format!("Failed to evict checkpoints: {}", e)))?;
        if deleted > 0 {
            debug!(deleted, "Evicted expired checkpoints");
        }
        Ok(deleted)
    }
}

impl StateStore for SqliteStateStore {
    fn checkpoint(&self, _request_id: &RequestId, state: &RunState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move { self.save(&state) })
    }

    fn load(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Option<RunState>>> {
        let request_id = request_id.clone();
        Box::pin(async move { self.get(&request_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::types::StateDelta;

    fn temp_store() -> (tempfile::TempDir, SqliteStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::open(&dir.path().join("nested/checkpoints.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, store) = temp_store();
        let state = RunState::new(RequestId::from_str("r1"), "when to leave").with_user("u1");
        store.save(&state).unwrap();

        let loaded = store.get(&RequestId::from_str("r1")).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.get(&RequestId::from_str("missing")).unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_previous() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut state = RunState::new(RequestId::from_str("r1"), "q");
        store.save(&state).unwrap();
        state.decision.error_notes.push("classifier: bad json".into());
        store.save(&state).unwrap();

        let loaded = store.get(&state.request_id).unwrap().unwrap();
        assert_eq!(loaded.decision.error_notes.len(), 1);
        assert_eq!(store.list(10).unwrap().len(), 1);
    }

    #[test]
    fn test_evict_only_finished() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut done = RunState::new(RequestId::from_str("done"), "q");
        done.decision.finished = true;
        let open = RunState::new(RequestId::from_str("open"), "q");
        store.save(&done).unwrap();
        store.save(&open).unwrap();

        assert_eq!(store.evict_expired(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.evict_expired(Duration::ZERO).unwrap(), 1);
        assert!(store.get(&RequestId::from_str("done")).unwrap().is_none());
        assert!(store.get(&RequestId::from_str("open")).unwrap().is_some());
    }

    #[test]
    fn test_list_and_delete() {
        let store = SqliteStateStore::in_memory().unwrap();
        store
            .save(&RunState::new(RequestId::from_str("a"), "q").with_user("u1"))
            .unwrap();
        let rows = store.list(5).unwrap();
        assert_eq!(rows[0].request_id.0, "a");
        assert_eq!(rows[0].user_id.as_deref(), Some("u1"));
        assert!(!rows[0].finished);

        assert_eq!(store.delete(&RequestId::from_str("a")).unwrap(), 1);
        assert!(store.list(5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_store_trait() {
        let store = SqliteStateStore::in_memory().unwrap();
        let base = RunState::new(RequestId::from_str("r9"), "q");
        let state = crate::graph::merge(&base, &StateDelta::new().with_user("u7"), &Default::default());
        store.checkpoint(&state.request_id, &state).await.unwrap();
        let loaded = store.load(&RequestId::from_str("r9")).await.unwrap().unwrap();
        assert_eq!(loaded.user_id.as_deref(), Some("u7"));
    }
}
