//! Partial updates: the only way a session changes.
//!
//! Components describe what they changed as a [`PartialUpdate`] built with
//! the chained setters below; the store merges it.

use std::collections::{BTreeMap, BTreeSet};
use stepflow_core::{
    CapabilityResult, DecisionOption, Evaluation, Intent, InterruptRequest, Message, StatePatch,
};

use crate::session::{AuditRecord, ErrorRecord, SessionStatus, StepMark, WarningRecord};

/// A set of changes to a [`Session`](crate::Session).
///
/// Updates carry only the fields they change. How each field is merged into
/// the session is decided by the [`ReducerTable`](crate::ReducerTable), not by
/// the update. Updates produced by sibling invocations of one step never set
/// scalar fields, so they can be applied in any order.
#[derive(Debug, Clone, Default)]
pub struct PartialUpdate {
    /// Appended to the conversation.
    pub messages: Vec<Message>,
    /// Appended to the error log.
    pub errors: Vec<ErrorRecord>,
    /// Appended to the warning log.
    pub warnings: Vec<WarningRecord>,
    /// Appended to the audit trail.
    pub audit_trail: Vec<AuditRecord>,

    /// Added to the iteration counter.
    pub iteration_count: u32,
    /// Added to the session's token total.
    pub total_tokens_used: u64,

    /// Latest result per capability; replaces the previous one.
    pub capability_results: BTreeMap<String, CapabilityResult>,
    /// Added to each capability's call count.
    pub call_counts: BTreeMap<String, u64>,
    /// Per-capability task payload overrides; replace earlier overrides.
    pub task_overrides: BTreeMap<String, serde_json::Value>,
    /// Approval decision per step mark.
    pub step_decisions: BTreeMap<String, DecisionOption>,

    /// Step marks to add to the completed set.
    pub completed_steps: BTreeSet<String>,
    /// Interrupt ids to add to the resolved set.
    pub resolved_interrupts: BTreeSet<String>,

    /// New session status.
    pub status: Option<SessionStatus>,
    /// Replaces the analyzed intent.
    pub intent: Option<Intent>,
    /// `Some(None)` clears the pending interrupt.
    pub pending_interrupt: Option<Option<InterruptRequest>>,
    /// Replaces the latest evaluation.
    pub last_evaluation: Option<Evaluation>,
    /// Set once the session completes.
    pub final_response: Option<serde_json::Value>,
    /// Set when the session fails.
    pub failure_reason: Option<String>,
}

impl PartialUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a conversation message.
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Append an error record.
    pub fn error(mut self, error: ErrorRecord) -> Self {
        self.errors.push(error);
        self
    }

    /// Append a warning record.
    pub fn warning(mut self, warning: WarningRecord) -> Self {
        self.warnings.push(warning);
        self
    }

    /// Append an audit record.
    pub fn audit(mut self, record: AuditRecord) -> Self {
        self.audit_trail.push(record);
        self
    }

    /// Record one capability result together with its call count and tokens.
    pub fn result(mut self, result: CapabilityResult) -> Self {
        *self
            .call_counts
            .entry(result.capability_name.clone())
            .or_insert(0) += u64::from(result.attempts);
        self.total_tokens_used += result.tokens_used;
        self.capability_results
            .insert(result.capability_name.clone(), result);
        self
    }

    /// Start the next iteration.
    pub fn next_iteration(mut self) -> Self {
        self.iteration_count += 1;
        self
    }

    /// Mark a step completed.
    pub fn completed(mut self, mark: StepMark) -> Self {
        self.completed_steps.insert(mark.key());
        self
    }

    /// Record the approval decision for a step.
    pub fn decision(mut self, mark: StepMark, decision: DecisionOption) -> Self {
        self.step_decisions.insert(mark.key(), decision);
        self
    }

    /// Mark an interrupt resolved.
    pub fn resolved(mut self, interrupt_id: impl Into<String>) -> Self {
        self.resolved_interrupts.insert(interrupt_id.into());
        self
    }

    /// Move the session to `status`.
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Replace the intent.
    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    /// Set the pending interrupt, or clear it with `None`.
    pub fn interrupt(mut self, request: Option<InterruptRequest>) -> Self {
        self.pending_interrupt = Some(request);
        self
    }

    /// Record an evaluation.
    pub fn evaluation(mut self, evaluation: Evaluation) -> Self {
        self.last_evaluation = Some(evaluation);
        self
    }

    /// Record the final response.
    pub fn final_response(mut self, response: serde_json::Value) -> Self {
        self.final_response = Some(response);
        self
    }

    /// Record why the session failed.
    pub fn failure(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    /// Whether this update sets any last-writer-wins field.
    pub fn touches_scalars(&self) -> bool {
        self.status.is_some()
            || self.intent.is_some()
            || self.pending_interrupt.is_some()
            || self.last_evaluation.is_some()
            || self.final_response.is_some()
            || self.failure_reason.is_some()
    }

    /// Whether applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.errors.is_empty()
            && self.warnings.is_empty()
            && self.audit_trail.is_empty()
            && self.iteration_count == 0
            && self.total_tokens_used == 0
            && self.capability_results.is_empty()
            && self.call_counts.is_empty()
            && self.task_overrides.is_empty()
            && self.step_decisions.is_empty()
            && self.completed_steps.is_empty()
            && self.resolved_interrupts.is_empty()
            && !self.touches_scalars()
    }
}

impl From<StatePatch> for PartialUpdate {
    fn from(patch: StatePatch) -> Self {
        Self {
            messages: patch.messages,
            warnings: patch
                .warnings
                .into_iter()
                .map(|w| WarningRecord::new("approver", w))
                .collect(),
            task_overrides: patch.task_overrides,
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepflow_core::CapabilityOutput;

    #[test]
    fn test_result_counts_attempts_and_tokens() {
        let result = CapabilityResult::success(
            "search",
            CapabilityOutput::new(serde_json::json!({}), 0.9).with_tokens(12),
            Utc::now(),
        )
        .with_attempts(2);
        let update = PartialUpdate::new().result(result);
        assert_eq!(update.call_counts["search"], 2);
        assert_eq!(update.total_tokens_used, 12);
        assert!(!update.touches_scalars());
        assert!(!update.is_empty());
    }

    #[test]
    fn test_patch_conversion() {
        let patch = StatePatch {
            messages: vec![Message::approver("narrow it", "ops")],
            warnings: vec!["scope reduced".into()],
            task_overrides: BTreeMap::from([("doc".to_string(), serde_json::json!({"q": 1}))]),
        };
        let update = PartialUpdate::from(patch);
        assert_eq!(update.messages.len(), 1);
        assert_eq!(update.warnings[0].origin, "approver");
        assert!(update.task_overrides.contains_key("doc"));
        assert!(!update.touches_scalars());
    }

    #[test]
    fn test_clearing_interrupt_is_a_scalar_write() {
        let update = PartialUpdate::new().interrupt(None);
        assert!(update.touches_scalars());
        assert_eq!(update.pending_interrupt, Some(None));
    }
}
