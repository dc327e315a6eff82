//! SQLite-backed checkpoint store (feature `sqlite`).

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointStore};
use crate::session::Session;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use stepflow_core::{Plan, StepflowError, StepflowResult};
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
    session_id TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    timestamp  TEXT NOT NULL,
    body       TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
)";

/// Checkpoints in a single SQLite table keyed by `(session_id, seq)`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StepflowResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// A private in-memory database.
    pub fn in_memory() -> StepflowResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StepflowResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> StepflowResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StepflowResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut *conn.lock()))
            .await
            .map_err(|e| StepflowError::Session(format!("sqlite task failed: {e}")))?
    }
}

fn to_sql_seq(seq: u64) -> StepflowResult<i64> {
    i64::try_from(seq).map_err(|_| StepflowError::Session(format!("seq {seq} out of range")))
}

fn from_sql_seq(seq: i64) -> u64 {
    u64::try_from(seq).unwrap_or(0)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, session: &Session, plan: &Plan, seq: u64) -> StepflowResult<CheckpointId> {
        let checkpoint = Checkpoint::new(session, plan, seq);
        let body = serde_json::to_string(&checkpoint)?;
        let id = checkpoint.id();
        let session_id = id.session_id.clone();
        let timestamp = checkpoint.timestamp.to_rfc3339();
        let sql_seq = to_sql_seq(seq)?;

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(seq) FROM checkpoints WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            if latest.is_some_and(|latest| latest >= sql_seq) {
                return Err(StepflowError::CheckpointConflict { session_id, seq });
            }
            tx.execute(
                "INSERT INTO checkpoints (session_id, seq, timestamp, body) VALUES (?1, ?2, ?3, ?4)",
                params![session_id, sql_seq, timestamp, body],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(session_id = %id.session_id, seq, "Checkpoint written");
        Ok(id)
    }

    async fn get(&self, session_id: &str, seq: u64) -> StepflowResult<Option<Checkpoint>> {
        let session_id = session_id.to_string();
        let sql_seq = to_sql_seq(seq)?;
        let body: Option<String> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM checkpoints WHERE session_id = ?1 AND seq = ?2",
                        params![session_id, sql_seq],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StepflowError::from))
            .transpose()
    }

    async fn list(&self, session_id: &str) -> StepflowResult<Vec<CheckpointId>> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT seq FROM checkpoints WHERE session_id = ?1 ORDER BY seq")?;
            let seqs = stmt
                .query_map(params![session_id], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(seqs
                .into_iter()
                .map(|seq| CheckpointId {
                    session_id: session_id.clone(),
                    seq: from_sql_seq(seq),
                })
                .collect())
        })
        .await
    }

    async fn sessions(&self) -> StepflowResult<Vec<String>> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT session_id FROM checkpoints ORDER BY session_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn prune(&self, session_id: &str, keep_latest: usize) -> StepflowResult<usize> {
        let session_id = session_id.to_string();
        let keep = i64::try_from(keep_latest.max(1)).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM checkpoints WHERE session_id = ?1 AND seq NOT IN (
                     SELECT seq FROM checkpoints WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
                 )",
                params![session_id, keep],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_conflict() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let session = Session::new(Some("s-1".into()), "q");
        store.save(&session, &Plan::empty(), 1).await.unwrap();
        store.save(&session, &Plan::empty(), 2).await.unwrap();
        assert!(matches!(
            store.save(&session, &Plan::empty(), 2).await.unwrap_err(),
            StepflowError::CheckpointConflict { .. }
        ));

        let checkpoint = store.get("s-1", 2).await.unwrap().unwrap();
        assert_eq!(checkpoint.session_state, session);
        assert!(store.get("s-1", 9).await.unwrap().is_none());
        assert_eq!(store.sessions().await.unwrap(), vec!["s-1"]);
    }

    #[tokio::test]
    async fn test_sqlite_prune() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let session = Session::new(Some("s-1".into()), "q");
        for seq in 1..=4 {
            store.save(&session, &Plan::empty(), seq).await.unwrap();
        }
        assert_eq!(store.prune("s-1", 1).await.unwrap(), 3);
        assert_eq!(store.latest_seq("s-1").await.unwrap(), Some(4));
    }
}
