use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`StepflowError`].
pub type StepflowResult<T> = Result<T, StepflowError>;

/// Top-level error type for the stepflow engine.
///
/// Capability-level failures are never reported through this type: they are
/// recorded as data in a `CapabilityResult` so the evaluator can reason about
/// them. The variants here either drive a state transition in the engine or
/// are returned to the caller of an engine operation.
#[derive(Debug, Error)]
pub enum StepflowError {
    /// The plan builder could not produce a plan for the requested capabilities.
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    /// A resume command was delivered for an interrupt that is already resolved.
    #[error("Interrupt {0} is already resolved")]
    AlreadyResolved(String),

    /// A resume command referenced an interrupt that was never raised.
    #[error("Unknown interrupt: {0}")]
    UnknownInterrupt(String),

    /// The decision carried by a resume command is not one of the offered options.
    #[error("Invalid decision '{decision}' for interrupt {interrupt_id}")]
    InvalidDecision {
        /// Interrupt the command was addressed to.
        interrupt_id: String,
        /// The rejected decision, rendered as text.
        decision: String,
    },

    /// The session used up its iteration budget without reaching the quality threshold.
    #[error("Iteration budget exceeded ({count}/{max})")]
    IterationBudgetExceeded {
        /// Iterations consumed.
        count: u32,
        /// Configured maximum.
        max: u32,
    },

    /// A checkpoint could not be persisted after the bounded number of retries.
    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    /// A checkpoint with this key already exists, or `seq` does not advance.
    #[error("Checkpoint conflict for session {session_id} at seq {seq}")]
    CheckpointConflict {
        /// Session the checkpoint belongs to.
        session_id: String,
        /// Offending sequence number.
        seq: u64,
    },

    /// No session (in memory or in the checkpoint store) has this id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Any other session-state error.
    #[error("Session error: {0}")]
    Session(String),

    /// Capability registry or invocation plumbing error.
    #[error("Capability error: {0}")]
    Capability(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The session was canceled externally.
    #[error("Session canceled")]
    Canceled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the SQLite checkpoint backend.
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Reasons the plan builder refuses to emit a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PlanningError {
    /// The capability dependency graph contains a cycle among these capabilities.
    #[error("dependency cycle among capabilities: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// A requested capability, or one of its declared dependencies, is not registered.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// The intent requested no capabilities at all.
    #[error("intent requested no capabilities")]
    EmptyIntent,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_error_display() {
        let err = PlanningError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "dependency cycle among capabilities: a, b");

        let wrapped: StepflowError = PlanningError::UnknownCapability("ghost".into()).into();
        assert_eq!(wrapped.to_string(), "Planning error: unknown capability: ghost");
    }

    #[test]
    fn test_planning_error_serialization() {
        let err = PlanningError::UnknownCapability("ghost".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unknown_capability");
        assert_eq!(json["detail"], "ghost");
        let parsed: PlanningError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_budget_error_display() {
        let err = StepflowError::IterationBudgetExceeded { count: 3, max: 3 };
        assert!(err.to_string().contains("3/3"));
    }
}
