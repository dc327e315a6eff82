//! In-memory session store with per-session serialized merges.
//!
//! Every write goes through [`SessionStateStore::preview`] and
//! [`SessionStateStore::commit`], or through `apply` when no checkpoint is
//! involved.

use crate::reducer::ReducerTable;
use crate::session::Session;
use crate::update::PartialUpdate;
use std::collections::HashMap;
use std::sync::Arc;
use stepflow_core::{StepflowError, StepflowResult};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// A merged session that has not been stored yet.
///
/// Produced by [`SessionStateStore::preview`] so the caller can persist the
/// result before making it visible with [`SessionStateStore::commit`].
#[derive(Debug, Clone)]
pub struct Preview {
    base_version: u64,
    session: Session,
}

impl Preview {
    /// The merged session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Version of the stored session the preview was merged onto.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }
}

/// Canonical in-memory state of every live session.
///
/// Writes are serialized per session; different sessions never contend
/// beyond the brief map lookup.
pub struct SessionStateStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    reducers: ReducerTable,
}

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new(ReducerTable::default())
    }
}

impl SessionStateStore {
    /// An empty store merging with `reducers`.
    pub fn new(reducers: ReducerTable) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reducers,
        }
    }

    /// The merge rules in use.
    pub fn reducers(&self) -> &ReducerTable {
        &self.reducers
    }

    /// Register a new session. Fails if the id is taken.
    pub async fn insert(&self, session: Session) -> StepflowResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(StepflowError::Session(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        sessions.insert(session.session_id.clone(), Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Replace (or create) a session wholesale. Used by recovery only.
    pub async fn restore(&self, session: Session) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), Arc::new(Mutex::new(session)));
    }

    async fn slot(&self, session_id: &str) -> StepflowResult<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StepflowError::SessionNotFound(session_id.to_string()))
    }

    /// A snapshot of a session.
    pub async fn get(&self, session_id: &str) -> StepflowResult<Session> {
        let slot = self.slot(session_id).await?;
        let session = slot.lock().await;
        Ok(session.clone())
    }

    /// Whether a session is held.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Merge one update into the stored session and return the result.
    pub async fn apply(&self, session_id: &str, update: PartialUpdate) -> StepflowResult<Session> {
        self.apply_all(session_id, vec![update]).await
    }

    /// Merge several updates, in order, as one write.
    pub async fn apply_all(
        &self,
        session_id: &str,
        updates: Vec<PartialUpdate>,
    ) -> StepflowResult<Session> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.lock().await;
        for update in updates {
            self.reducers.apply(&mut session, update);
        }
        debug!(session_id, version = session.version, "Applied session update");
        Ok(session.clone())
    }

    /// Compute the merged session without storing it.
    pub async fn preview(
        &self,
        session_id: &str,
        updates: Vec<PartialUpdate>,
    ) -> StepflowResult<Preview> {
        let slot = self.slot(session_id).await?;
        let current = slot.lock().await;
        let base_version = current.version;
        let mut session = current.clone();
        drop(current);
        for update in updates {
            self.reducers.apply(&mut session, update);
        }
        Ok(Preview {
            base_version,
            session,
        })
    }

    /// Store a previewed session, provided nothing was applied since.
    pub async fn commit(&self, preview: Preview) -> StepflowResult<Session> {
        let slot = self.slot(&preview.session.session_id).await?;
        let mut session = slot.lock().await;
        if session.version != preview.base_version {
            return Err(StepflowError::Session(format!(
                "session {} moved from version {} to {} since preview",
                session.session_id, preview.base_version, session.version
            )));
        }
        *session = preview.session;
        Ok(session.clone())
    }

    /// Drop a session, returning its last state.
    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        let slot = self.sessions.write().await.remove(session_id)?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    /// Ids of every held session, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::session::{AuditRecord, SessionStatus};

    #[tokio::test]
    async fn test_insert_apply_get() {
        let store = SessionStateStore::default();
        store.insert(Session::new(Some("s-1".into()), "q")).await.unwrap();
        assert!(store.insert(Session::new(Some("s-1".into()), "q")).await.is_err());

        let session = store
            .apply("s-1", PartialUpdate::new().status(SessionStatus::Planning))
            .await
            .unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(store.get("s-1").await.unwrap().status, SessionStatus::Planning);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = SessionStateStore::default();
        let err = store.get("ghost").await.unwrap_err();
        assert!(matches!(err, StepflowError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_preview_then_commit() {
        let store = SessionStateStore::default();
        store.insert(Session::new(Some("s-1".into()), "q")).await.unwrap();

        let preview = store
            .preview(
                "s-1",
                vec![PartialUpdate::new().audit(AuditRecord::new("engine", "planned"))],
            )
            .await
            .unwrap();
        assert_eq!(preview.session().version, 1);
        assert_eq!(store.get("s-1").await.unwrap().version, 0);

        let committed = store.commit(preview).await.unwrap();
        assert_eq!(committed.audit_trail.len(), 1);
        assert_eq!(store.get("s-1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_stale_preview_is_rejected() {
        let store = SessionStateStore::default();
        store.insert(Session::new(Some("s-1".into()), "q")).await.unwrap();
        let preview = store.preview("s-1", vec![PartialUpdate::new()]).await.unwrap();
        store.apply("s-1", PartialUpdate::new()).await.unwrap();
        assert!(store.commit(preview).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_and_ids() {
        let store = SessionStateStore::default();
        store.insert(Session::new(Some("b".into()), "q")).await.unwrap();
        store.insert(Session::new(Some("a".into()), "q")).await.unwrap();
        assert_eq!(store.ids().await, vec!["a", "b"]);
        assert!(store.remove("a").await.is_some());
        assert!(!store.contains("a").await);
    }
}
