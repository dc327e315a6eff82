//! Session state, merge rules and checkpoint persistence for stepflow.
//!
//! A [`Session`] is only ever changed by merging a [`PartialUpdate`] through
//! the [`ReducerTable`]; the [`SessionStateStore`] serializes those merges per
//! session. [`CheckpointStore`] implementations persist immutable snapshots
//! keyed by `(session_id, seq)`.

/// Checkpoint snapshots and the stores that persist them.
pub mod checkpoint;
/// Per-session async write locks.
pub mod locks;
/// Field-by-field merge rules.
pub mod reducer;
/// The session record.
pub mod session;
/// SQLite checkpoint store.
#[cfg(feature = "sqlite")]
pub mod sqlite;
/// In-memory session store.
pub mod store;
/// Partial updates.
pub mod update;

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use locks::SessionLocks;
pub use reducer::{Field, FieldKind, LogCaps, MergeRule, ReducerTable};
pub use session::{AuditRecord, ErrorRecord, Session, SessionStatus, StepMark, WarningRecord};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;
pub use store::{Preview, SessionStateStore};
pub use update::PartialUpdate;
