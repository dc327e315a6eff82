//! The session record and the log entries it accumulates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use stepflow_core::{
    CapabilityResult, DecisionOption, Evaluation, Intent, InterruptRequest, Message,
};
use uuid::Uuid;

/// Where a session is in the workflow state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Turning the query into an intent.
    #[default]
    Analyzing,
    /// Building a plan from the intent.
    Planning,
    /// Running plan steps.
    Executing,
    /// Waiting for an approval decision.
    Interrupted,
    /// Scoring the iteration's results.
    Evaluating,
    /// Finished with a final response.
    Completed,
    /// Stopped with a failure reason.
    Failed,
}

impl SessionStatus {
    /// `completed` or `failed`: no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Analyzing => "analyzing",
            SessionStatus::Planning => "planning",
            SessionStatus::Executing => "executing",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Evaluating => "evaluating",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An error recorded in the session log. Never raised, only kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Component or capability that produced the error.
    pub origin: String,
    /// Human-readable description.
    pub message: String,
    /// Step the error belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ErrorRecord {
    /// An error record stamped now.
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            origin: origin.into(),
            message: message.into(),
            step_id: None,
        }
    }

    /// Attach the step the error belongs to.
    pub fn in_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// A non-fatal problem worth surfacing, e.g. an ambiguous query term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    /// When the warning was recorded.
    pub timestamp: DateTime<Utc>,
    /// Component that raised it.
    pub origin: String,
    /// Human-readable description.
    pub message: String,
}

impl WarningRecord {
    /// A warning stamped now.
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            origin: origin.into(),
            message: message.into(),
        }
    }
}

/// One entry of the capped audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Component that recorded it.
    pub origin: String,
    /// Machine-readable event name, e.g. `capability_invoked`.
    pub event: String,
    /// Event-specific payload.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// An audit record stamped now, without details.
    pub fn new(origin: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            origin: origin.into(),
            event: event.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach an event payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Key under which per-step facts (completion, approval decisions) are stored.
///
/// Marks are scoped by iteration so a retried plan runs its steps again.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepMark {
    /// Iteration the step ran in.
    pub iteration: u32,
    /// Step id within that iteration's plan.
    pub step_id: String,
}

impl StepMark {
    /// The mark of `step_id` in `iteration`.
    pub fn new(iteration: u32, step_id: impl Into<String>) -> Self {
        Self {
            iteration,
            step_id: step_id.into(),
        }
    }

    /// The string key used in the session's step maps.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StepMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.iteration, self.step_id)
    }
}

/// The canonical state of one end-to-end interaction.
///
/// Only the session state store mutates a `Session`, by applying
/// [`PartialUpdate`](crate::PartialUpdate)s through the reducer table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Stable identifier, supplied by the caller or generated.
    pub session_id: String,
    /// The request that started the session.
    pub user_query: String,
    /// Current state machine status.
    pub status: SessionStatus,
    /// Incremented by every applied update.
    pub version: u64,
    /// Iterations started, including the current one.
    pub iteration_count: u32,
    /// Conversation, oldest first.
    pub messages: Vec<Message>,
    /// Capped error log.
    pub errors: Vec<ErrorRecord>,
    /// Capped warning log.
    pub warnings: Vec<WarningRecord>,
    /// Capped audit trail.
    pub audit_trail: Vec<AuditRecord>,
    /// Most recent result per capability.
    pub capability_results: BTreeMap<String, CapabilityResult>,
    /// Invocation attempts per capability.
    pub call_counts: BTreeMap<String, u64>,
    /// Tokens reported across every invocation.
    pub total_tokens_used: u64,
    /// Latest analyzed intent.
    #[serde(default)]
    pub intent: Option<Intent>,
    /// `"<iteration>/<step_id>"` marks of finished steps.
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,
    /// Approval decisions, keyed like `completed_steps`.
    #[serde(default)]
    pub step_decisions: BTreeMap<String, DecisionOption>,
    /// Approver-supplied task payloads per capability.
    #[serde(default)]
    pub task_overrides: BTreeMap<String, serde_json::Value>,
    /// Set while the session waits for an approver.
    #[serde(default)]
    pub pending_interrupt: Option<InterruptRequest>,
    /// Ids of every interrupt already resolved.
    #[serde(default)]
    pub resolved_interrupts: BTreeSet<String>,
    /// Latest iteration evaluation.
    #[serde(default)]
    pub last_evaluation: Option<Evaluation>,
    /// Set once the session completes.
    #[serde(default)]
    pub final_response: Option<serde_json::Value>,
    /// Set once the session fails.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the last update was applied.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session; a v4 UUID is generated when no id is supplied.
    pub fn new(session_id: Option<String>, user_query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_query: user_query.into(),
            status: SessionStatus::Analyzing,
            version: 0,
            iteration_count: 0,
            messages: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            audit_trail: Vec::new(),
            capability_results: BTreeMap::new(),
            call_counts: BTreeMap::new(),
            total_tokens_used: 0,
            intent: None,
            completed_steps: BTreeSet::new(),
            step_decisions: BTreeMap::new(),
            task_overrides: BTreeMap::new(),
            pending_interrupt: None,
            resolved_interrupts: BTreeSet::new(),
            last_evaluation: None,
            final_response: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether step `step_id` finished in `iteration`.
    pub fn is_step_completed(&self, iteration: u32, step_id: &str) -> bool {
        self.completed_steps
            .contains(&StepMark::new(iteration, step_id).key())
    }

    /// The approval decision recorded for step `step_id` in `iteration`.
    pub fn step_decision(&self, iteration: u32, step_id: &str) -> Option<DecisionOption> {
        self.step_decisions
            .get(&StepMark::new(iteration, step_id).key())
            .copied()
    }

    /// Results produced in `iteration`, keyed by capability.
    pub fn results_in(&self, iteration: u32) -> impl Iterator<Item = &CapabilityResult> {
        self.capability_results
            .values()
            .filter(move |r| r.iteration == iteration)
    }

    /// The newest `n` audit entries, oldest first.
    pub fn audit_tail(&self, n: usize) -> &[AuditRecord] {
        let start = self.audit_trail.len().saturating_sub(n);
        &self.audit_trail[start..]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new(None, "summarize sales");
        assert_eq!(session.status, SessionStatus::Analyzing);
        assert_eq!(session.version, 0);
        assert!(Uuid::parse_str(&session.session_id).is_ok());

        let named = Session::new(Some("s-42".into()), "q");
        assert_eq!(named.session_id, "s-42");
    }

    #[test]
    fn test_step_marks() {
        let mut session = Session::new(None, "q");
        session
            .completed_steps
            .insert(StepMark::new(2, "step_1").key());
        assert!(session.is_step_completed(2, "step_1"));
        assert!(!session.is_step_completed(3, "step_1"));
        assert_eq!(StepMark::new(2, "step_1").to_string(), "2/step_1");
    }

    #[test]
    fn test_session_roundtrip() {
        let mut session = Session::new(Some("s-1".into()), "q");
        session.messages.push(Message::user("q"));
        session
            .audit_trail
            .push(AuditRecord::new("engine", "session_started"));
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_terminal_status() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Interrupted.is_terminal());
    }
}
