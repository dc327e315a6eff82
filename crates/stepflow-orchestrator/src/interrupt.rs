//! Exactly-once resolution of human approval interrupts.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stepflow_core::{
    DecisionOption, InterruptRequest, ResumeCommand, StatePatch, StepflowError, StepflowResult,
};
use tracing::info;

/// Who resolved an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionOrigin {
    /// A resume command.
    Manual,
    /// The interrupt expired and its default decision was applied.
    Timeout,
}

/// State of one tracked interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "decision", rename_all = "lowercase")]
pub enum InterruptStatus {
    /// Waiting for a decision.
    Pending,
    /// Resolved with the given decision.
    Resolved(DecisionOption),
}

/// The single `pending -> resolved` transition of one interrupt.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The interrupt that was resolved.
    pub request: InterruptRequest,
    /// The decision applied.
    pub decision: DecisionOption,
    /// Approver or timeout.
    pub origin: ResolutionOrigin,
    /// Reviewer named in the resume command.
    pub reviewer: Option<String>,
    /// Merged into the session alongside the decision.
    pub state_patch: Option<StatePatch>,
    /// When the resolution happened.
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum Entry {
    Pending(InterruptRequest),
    Resolved {
        session_id: String,
        decision: DecisionOption,
    },
}

impl Entry {
    fn session_id(&self) -> &str {
        match self {
            Entry::Pending(request) => &request.session_id,
            Entry::Resolved { session_id, .. } => session_id,
        }
    }
}

/// Tracks every interrupt raised by the engine.
#[derive(Default)]
pub struct InterruptController {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InterruptController {
    /// An empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending interrupt.
    pub fn raise(&self, request: InterruptRequest) {
        info!(
            interrupt_id = %request.interrupt_id,
            session_id = %request.session_id,
            step_id = %request.step_id,
            "Interrupt raised"
        );
        self.entries
            .write()
            .insert(request.interrupt_id.clone(), Entry::Pending(request));
    }

    /// Re-register a pending interrupt loaded from a checkpoint.
    pub fn restore(&self, request: InterruptRequest) {
        let mut entries = self.entries.write();
        if !matches!(entries.get(&request.interrupt_id), Some(Entry::Resolved { .. })) {
            entries.insert(request.interrupt_id.clone(), Entry::Pending(request));
        }
    }

    /// Resolve a pending interrupt. Only the first resolution succeeds.
    pub fn resolve(
        &self,
        command: ResumeCommand,
        origin: ResolutionOrigin,
    ) -> StepflowResult<Resolution> {
        let mut entries = self.entries.write();
        let request = match entries.get(&command.interrupt_id) {
            None => return Err(StepflowError::UnknownInterrupt(command.interrupt_id)),
            Some(Entry::Resolved { .. }) => {
                return Err(StepflowError::AlreadyResolved(command.interrupt_id))
            }
            Some(Entry::Pending(request)) => request.clone(),
        };

        let decision = command
            .decision
            .to_option()
            .filter(|option| request.offers(*option))
            .ok_or_else(|| StepflowError::InvalidDecision {
                interrupt_id: command.interrupt_id.clone(),
                decision: command.decision.to_string(),
            })?;

        entries.insert(
            command.interrupt_id.clone(),
            Entry::Resolved {
                session_id: request.session_id.clone(),
                decision,
            },
        );
        info!(
            interrupt_id = %command.interrupt_id,
            decision = %decision,
            origin = ?origin,
            "Interrupt resolved"
        );
        Ok(Resolution {
            request,
            decision,
            origin,
            reviewer: command.reviewer,
            state_patch: command.state_patch,
            resolved_at: Utc::now(),
        })
    }

    /// Apply the interrupt's `default_on_timeout` decision.
    pub fn resolve_on_timeout(&self, interrupt_id: &str) -> StepflowResult<Resolution> {
        let default = match self.entries.read().get(interrupt_id) {
            Some(Entry::Pending(request)) => request.default_on_timeout,
            Some(Entry::Resolved { .. }) => {
                return Err(StepflowError::AlreadyResolved(interrupt_id.to_string()))
            }
            None => return Err(StepflowError::UnknownInterrupt(interrupt_id.to_string())),
        };
        self.resolve(
            ResumeCommand::new(interrupt_id, default),
            ResolutionOrigin::Timeout,
        )
    }

    /// Current state of an interrupt, if it is tracked.
    pub fn status(&self, interrupt_id: &str) -> Option<InterruptStatus> {
        self.entries.read().get(interrupt_id).map(|entry| match entry {
            Entry::Pending(_) => InterruptStatus::Pending,
            Entry::Resolved { decision, .. } => InterruptStatus::Resolved(*decision),
        })
    }

    /// Pending interrupts, oldest first.
    pub fn pending(&self) -> Vec<InterruptRequest> {
        let mut pending: Vec<InterruptRequest> = self
            .entries
            .read()
            .values()
            .filter_map(|entry| match entry {
                Entry::Pending(request) => Some(request.clone()),
                Entry::Resolved { .. } => None,
            })
            .collect();
        pending.sort_by_key(|r| r.raised_at);
        pending
    }

    /// Drop every interrupt of a session that reached a terminal status.
    /// Later resumes are answered from its checkpoint.
    pub fn forget_session(&self, session_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.session_id() != session_id);
        before - entries.len()
    }

    /// Number of tracked interrupts, pending or resolved.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no interrupt is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepflow_core::ResumeDecision;

    fn request(id: &str) -> InterruptRequest {
        InterruptRequest {
            interrupt_id: id.into(),
            session_id: "s-1".into(),
            step_id: "step_2".into(),
            iteration: 1,
            reason: "critical".into(),
            options: vec![DecisionOption::Approve, DecisionOption::Reject],
            default_on_timeout: DecisionOption::Reject,
            raised_at: Utc::now(),
            timeout_ms: 1000,
        }
    }

    #[test]
    fn test_resolve_once() {
        let controller = InterruptController::new();
        controller.raise(request("i-1"));
        assert_eq!(controller.status("i-1"), Some(InterruptStatus::Pending));

        let resolution = controller
            .resolve(
                ResumeCommand::new("i-1", DecisionOption::Approve).with_reviewer("ops"),
                ResolutionOrigin::Manual,
            )
            .unwrap();
        assert_eq!(resolution.decision, DecisionOption::Approve);
        assert_eq!(resolution.reviewer.as_deref(), Some("ops"));

        let err = controller
            .resolve(
                ResumeCommand::new("i-1", DecisionOption::Approve),
                ResolutionOrigin::Manual,
            )
            .unwrap_err();
        assert!(matches!(err, StepflowError::AlreadyResolved(_)));
        assert!(controller.pending().is_empty());
    }

    #[test]
    fn test_unknown_and_invalid() {
        let controller = InterruptController::new();
        let err = controller
            .resolve(
                ResumeCommand::new("nope", DecisionOption::Approve),
                ResolutionOrigin::Manual,
            )
            .unwrap_err();
        assert!(matches!(err, StepflowError::UnknownInterrupt(_)));

        controller.raise(request("i-2"));
        // Modify is not offered by this request.
        let err = controller
            .resolve(
                ResumeCommand::new("i-2", DecisionOption::Modify),
                ResolutionOrigin::Manual,
            )
            .unwrap_err();
        assert!(matches!(err, StepflowError::InvalidDecision { .. }));
        let err = controller
            .resolve(
                ResumeCommand::new("i-2", ResumeDecision::Raw(serde_json::json!("maybe"))),
                ResolutionOrigin::Manual,
            )
            .unwrap_err();
        assert!(matches!(err, StepflowError::InvalidDecision { .. }));
        // Still pending after invalid attempts.
        assert_eq!(controller.status("i-2"), Some(InterruptStatus::Pending));
    }

    #[test]
    fn test_timeout_applies_default() {
        let controller = InterruptController::new();
        controller.raise(request("i-3"));
        let resolution = controller.resolve_on_timeout("i-3").unwrap();
        assert_eq!(resolution.decision, DecisionOption::Reject);
        assert_eq!(resolution.origin, ResolutionOrigin::Timeout);
        assert!(controller.resolve_on_timeout("i-3").is_err());
    }

    #[test]
    fn test_concurrent_resolution_has_one_winner() {
        let controller = Arc::new(InterruptController::new());
        controller.raise(request("i-4"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    controller
                        .resolve(
                            ResumeCommand::new("i-4", true_decision()),
                            ResolutionOrigin::Manual,
                        )
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    fn true_decision() -> ResumeDecision {
        ResumeDecision::Raw(serde_json::json!(true))
    }

    #[test]
    fn test_forget_session_drops_only_its_interrupts() {
        let controller = InterruptController::new();
        controller.raise(request("i-6"));
        controller.resolve_on_timeout("i-6").unwrap();
        let mut other = request("i-7");
        other.session_id = "s-2".into();
        controller.raise(other);

        assert_eq!(controller.forget_session("s-1"), 1);
        assert_eq!(controller.len(), 1);
        assert_eq!(controller.status("i-6"), None);
        assert_eq!(controller.status("i-7"), Some(InterruptStatus::Pending));
    }

    #[test]
    fn test_restore_keeps_resolved() {
        let controller = InterruptController::new();
        controller.raise(request("i-5"));
        controller.resolve_on_timeout("i-5").unwrap();
        controller.restore(request("i-5"));
        assert!(matches!(
            controller.status("i-5"),
            Some(InterruptStatus::Resolved(_))
        ));
    }
}
