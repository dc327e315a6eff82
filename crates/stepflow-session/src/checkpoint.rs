//! Append-only durable snapshots of a session and its plan.

use crate::locks::SessionLocks;
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use stepflow_core::{Plan, StepflowError, StepflowResult};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// An immutable snapshot, keyed by `(session_id, seq)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Session the snapshot belongs to.
    pub session_id: String,
    /// Monotonic per session; never reused.
    pub seq: u64,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// The plan in force at `seq`.
    pub plan: Plan,
    /// The session as committed at `seq`.
    pub session_state: Session,
}

impl Checkpoint {
    /// Snapshot `session` and `plan` at `seq`.
    pub fn new(session: &Session, plan: &Plan, seq: u64) -> Self {
        Self {
            session_id: session.session_id.clone(),
            seq,
            timestamp: Utc::now(),
            plan: plan.clone(),
            session_state: session.clone(),
        }
    }

    /// The key of this checkpoint.
    pub fn id(&self) -> CheckpointId {
        CheckpointId {
            session_id: self.session_id.clone(),
            seq: self.seq,
        }
    }
}

/// Key of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    /// Session the checkpoint belongs to.
    pub session_id: String,
    /// Position in the session's checkpoint sequence.
    pub seq: u64,
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.seq)
    }
}

fn conflict(session_id: &str, seq: u64) -> StepflowError {
    StepflowError::CheckpointConflict {
        session_id: session_id.to_string(),
        seq,
    }
}

/// Durable, append-only checkpoint storage.
///
/// `save` never overwrites: a `seq` that does not exceed the latest stored
/// one for the session is a [`StepflowError::CheckpointConflict`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot at `seq`.
    async fn save(&self, session: &Session, plan: &Plan, seq: u64) -> StepflowResult<CheckpointId>;

    /// The checkpoint stored at `seq`, if any.
    async fn get(&self, session_id: &str, seq: u64) -> StepflowResult<Option<Checkpoint>>;

    /// Checkpoints of a session, oldest first.
    async fn list(&self, session_id: &str) -> StepflowResult<Vec<CheckpointId>>;

    /// Every session with at least one checkpoint.
    async fn sessions(&self) -> StepflowResult<Vec<String>>;

    /// Delete all but the newest `keep_latest` checkpoints. Returns how many were removed.
    async fn prune(&self, session_id: &str, keep_latest: usize) -> StepflowResult<usize>;

    /// Drop per-session bookkeeping once a session reached a terminal
    /// status. Stored checkpoints are kept.
    fn release(&self, _session_id: &str) {}

    /// Highest stored `seq` of a session.
    async fn latest_seq(&self, session_id: &str) -> StepflowResult<Option<u64>> {
        Ok(self.list(session_id).await?.last().map(|id| id.seq))
    }

    /// The session and plan stored at `seq`, or at the latest checkpoint.
    async fn load(&self, session_id: &str, seq: Option<u64>) -> StepflowResult<(Session, Plan)> {
        let seq = match seq {
            Some(seq) => seq,
            None => self
                .latest_seq(session_id)
                .await?
                .ok_or_else(|| StepflowError::SessionNotFound(session_id.to_string()))?,
        };
        let checkpoint = self.get(session_id, seq).await?.ok_or_else(|| {
            StepflowError::SessionNotFound(format!("{session_id} (no checkpoint at seq {seq})"))
        })?;
        Ok((checkpoint.session_state, checkpoint.plan))
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Volatile checkpoint store, for tests and single-process runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, BTreeMap<u64, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, session: &Session, plan: &Plan, seq: u64) -> StepflowResult<CheckpointId> {
        let mut all = self.checkpoints.write();
        let entries = all.entry(session.session_id.clone()).or_default();
        if entries.keys().next_back().is_some_and(|latest| *latest >= seq) {
            return Err(conflict(&session.session_id, seq));
        }
        let checkpoint = Checkpoint::new(session, plan, seq);
        let id = checkpoint.id();
        entries.insert(seq, checkpoint);
        Ok(id)
    }

    async fn get(&self, session_id: &str, seq: u64) -> StepflowResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(session_id)
            .and_then(|entries| entries.get(&seq))
            .cloned())
    }

    async fn list(&self, session_id: &str) -> StepflowResult<Vec<CheckpointId>> {
        Ok(self
            .checkpoints
            .read()
            .get(session_id)
            .map(|entries| entries.values().map(Checkpoint::id).collect())
            .unwrap_or_default())
    }

    async fn sessions(&self) -> StepflowResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .checkpoints
            .read()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn prune(&self, session_id: &str, keep_latest: usize) -> StepflowResult<usize> {
        let mut all = self.checkpoints.write();
        let Some(entries) = all.get_mut(session_id) else {
            return Ok(0);
        };
        let excess = entries.len().saturating_sub(keep_latest.max(1));
        let doomed: Vec<u64> = entries.keys().take(excess).copied().collect();
        for seq in &doomed {
            entries.remove(seq);
        }
        Ok(doomed.len())
    }
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// JSON checkpoints on disk: `<root>/<hex(session_id)>/<seq>.json`.
///
/// Each checkpoint is written to a temporary file, synced, then renamed into
/// place, so a crash never leaves a partial checkpoint behind.
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: SessionLocks,
}

impl FileCheckpointStore {
    /// A store rooted at `dir`, created if missing.
    pub async fn new(dir: PathBuf) -> StepflowResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: SessionLocks::new(),
        })
    }

    /// Sessions currently holding a write lock entry.
    pub fn locked_sessions(&self) -> usize {
        self.locks.len()
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.dir.join(hex::encode(session_id))
    }

    fn checkpoint_path(&self, session_id: &str, seq: u64) -> PathBuf {
        self.session_dir(session_id).join(format!("{seq:020}.json"))
    }

    async fn seqs(&self, session_id: &str) -> StepflowResult<Vec<u64>> {
        let dir = self.session_dir(session_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut seqs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(seq) = stem.parse::<u64>() {
                        seqs.push(seq);
                    }
                }
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, session: &Session, plan: &Plan, seq: u64) -> StepflowResult<CheckpointId> {
        let session_id = session.session_id.as_str();
        let lock = self.locks.get(session_id);
        let _guard = lock.lock().await;

        if self
            .seqs(session_id)
            .await?
            .last()
            .is_some_and(|latest| *latest >= seq)
        {
            return Err(conflict(session_id, seq));
        }

        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let checkpoint = Checkpoint::new(session, plan, seq);
        let json = serde_json::to_vec_pretty(&checkpoint)?;
        let path = self.checkpoint_path(session_id, seq);
        let tmp = dir.join(format!(".{seq:020}.json.tmp"));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        debug!(session_id, seq, path = %path.display(), "Checkpoint written");
        Ok(checkpoint.id())
    }

    async fn get(&self, session_id: &str, seq: u64) -> StepflowResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(session_id, seq);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&data).map_err(|e| {
            StepflowError::Session(format!("Failed to parse checkpoint {}: {e}", path.display()))
        })?;
        Ok(Some(checkpoint))
    }

    async fn list(&self, session_id: &str) -> StepflowResult<Vec<CheckpointId>> {
        Ok(self
            .seqs(session_id)
            .await?
            .into_iter()
            .map(|seq| CheckpointId {
                session_id: session_id.to_string(),
                seq,
            })
            .collect())
    }

    async fn sessions(&self) -> StepflowResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match hex::decode(&name).map(String::from_utf8) {
                Ok(Ok(id)) => ids.push(id),
                _ => warn!(dir = %name, "Skipping unrecognized checkpoint directory"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn prune(&self, session_id: &str, keep_latest: usize) -> StepflowResult<usize> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock().await;

        let seqs = self.seqs(session_id).await?;
        let excess = seqs.len().saturating_sub(keep_latest.max(1));
        for seq in &seqs[..excess] {
            tokio::fs::remove_file(self.checkpoint_path(session_id, *seq)).await?;
        }
        if excess > 0 {
            debug!(session_id, removed = excess, "Pruned checkpoints");
        }
        Ok(excess)
    }

    fn release(&self, session_id: &str) {
        self.locks.forget(session_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(id: &str) -> Session {
        Session::new(Some(id.to_string()), "q")
    }

    #[tokio::test]
    async fn test_memory_store_rejects_non_increasing_seq() {
        let store = MemoryCheckpointStore::new();
        let plan = Plan::empty();
        store.save(&session("s-1"), &plan, 1).await.unwrap();
        store.save(&session("s-1"), &plan, 3).await.unwrap();
        let err = store.save(&session("s-1"), &plan, 3).await.unwrap_err();
        assert!(matches!(err, StepflowError::CheckpointConflict { seq: 3, .. }));
        assert!(store.save(&session("s-1"), &plan, 2).await.is_err());
        assert_eq!(store.latest_seq("s-1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_file_store_layout_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();

        let mut s = session("user/42");
        store.save(&s, &Plan::empty(), 1).await.unwrap();
        s.iteration_count = 2;
        store.save(&s, &Plan::empty(), 2).await.unwrap();

        let dir = tmp.path().join(hex::encode("user/42"));
        assert!(dir.join(format!("{:020}.json", 2)).exists());

        let (loaded, _) = store.load("user/42", None).await.unwrap();
        assert_eq!(loaded.iteration_count, 2);
        let (first, _) = store.load("user/42", Some(1)).await.unwrap();
        assert_eq!(first.iteration_count, 0);
        assert_eq!(store.sessions().await.unwrap(), vec!["user/42"]);
    }

    #[tokio::test]
    async fn test_file_store_prune_keeps_latest() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        for seq in 1..=5 {
            store.save(&session("s"), &Plan::empty(), seq).await.unwrap();
        }
        assert_eq!(store.prune("s", 2).await.unwrap(), 3);
        let seqs: Vec<u64> = store.list("s").await.unwrap().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_file_store_release_keeps_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        store.save(&session("s"), &Plan::empty(), 1).await.unwrap();
        assert_eq!(store.locked_sessions(), 1);

        store.release("s");
        assert_eq!(store.locked_sessions(), 0);
        assert_eq!(store.latest_seq("s").await.unwrap(), Some(1));
        store.save(&session("s"), &Plan::empty(), 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_unknown_session() {
        let store = MemoryCheckpointStore::new();
        let err = store.load("ghost", None).await.unwrap_err();
        assert!(matches!(err, StepflowError::SessionNotFound(_)));
    }
}
