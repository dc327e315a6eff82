use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily created async locks, one per session id.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    /// No locks yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `session_id`. Hold its guard across the whole write.
    pub fn get(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry of a session that will not be written again.
    pub fn forget(&self, session_id: &str) {
        self.locks.lock().remove(session_id);
    }

    /// Sessions with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no session has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
