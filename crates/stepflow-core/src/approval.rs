//! Approval types for human-in-the-loop (HITL) workflows.
//!
//! These types live in `stepflow-core` so that the session crate (which
//! persists pending interrupts and patches) and the orchestrator (which raises
//! and resolves them) can share them without circular deps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::message::Message;

/// Which steps require a human decision before they run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Every step is gated.
    All,
    /// Only steps containing a critical capability are gated.
    #[default]
    CriticalOnly,
    /// No step is gated.
    None,
}

impl ApprovalMode {
    /// Parse `all`, `critical-only` or `none`, case-insensitively.
    pub fn parse_mode(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "all" => Some(ApprovalMode::All),
            "critical-only" | "critical_only" | "critical" => Some(ApprovalMode::CriticalOnly),
            "none" | "off" => Some(ApprovalMode::None),
            _ => None,
        }
    }
}

/// An option offered to the approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionOption {
    /// Run the step as planned.
    Approve,
    /// Run the step with the approver's state patch.
    Modify,
    /// Skip the step; its capabilities are recorded as rejected.
    Reject,
}

impl DecisionOption {
    /// All options, in the order they are offered.
    pub const ALL: [DecisionOption; 3] = [
        DecisionOption::Approve,
        DecisionOption::Modify,
        DecisionOption::Reject,
    ];

    /// Whether the gated step may run after this decision.
    pub fn allows_execution(self) -> bool {
        !matches!(self, DecisionOption::Reject)
    }
}

impl fmt::Display for DecisionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionOption::Approve => "approve",
            DecisionOption::Modify => "modify",
            DecisionOption::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// A pause in execution awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    /// Unique id; resume commands refer to it.
    pub interrupt_id: String,
    /// Session the interrupt belongs to.
    pub session_id: String,
    /// The gated step.
    pub step_id: String,
    /// Iteration the step belongs to.
    pub iteration: u32,
    /// Why approval is required.
    pub reason: String,
    /// Decisions the approver may choose from.
    pub options: Vec<DecisionOption>,
    /// Applied when nobody answers in time.
    pub default_on_timeout: DecisionOption,
    /// When the interrupt was raised.
    pub raised_at: DateTime<Utc>,
    /// How long the approver has to answer.
    pub timeout_ms: u64,
}

impl InterruptRequest {
    /// When the timeout default applies.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ms = i64::try_from(self.timeout_ms).unwrap_or(i64::MAX / 2);
        self.raised_at + Duration::milliseconds(ms)
    }

    /// Whether `option` is a valid answer.
    pub fn offers(&self, option: DecisionOption) -> bool {
        self.options.contains(&option)
    }
}

/// The decision carried by a [`ResumeCommand`].
///
/// Reviewers may answer with one of the offered options or with a loose
/// JSON value (`true`, `"yes"`, `"n"`, ...) which is mapped onto an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeDecision {
    /// One of the offered options.
    Choice(DecisionOption),
    /// Any other JSON value, mapped with [`ResumeDecision::to_option`].
    Raw(serde_json::Value),
}

impl ResumeDecision {
    /// Map the decision onto an option, or `None` if it is unrecognized.
    pub fn to_option(&self) -> Option<DecisionOption> {
        match self {
            ResumeDecision::Choice(option) => Some(*option),
            ResumeDecision::Raw(serde_json::Value::Bool(true)) => Some(DecisionOption::Approve),
            ResumeDecision::Raw(serde_json::Value::Bool(false)) => Some(DecisionOption::Reject),
            ResumeDecision::Raw(serde_json::Value::String(s)) => {
                match s.trim().to_lowercase().as_str() {
                    "approve" | "approved" | "yes" | "y" => Some(DecisionOption::Approve),
                    "reject" | "rejected" | "no" | "n" => Some(DecisionOption::Reject),
                    "modify" | "edit" => Some(DecisionOption::Modify),
                    _ => None,
                }
            }
            ResumeDecision::Raw(_) => None,
        }
    }
}

impl From<DecisionOption> for ResumeDecision {
    fn from(option: DecisionOption) -> Self {
        ResumeDecision::Choice(option)
    }
}

impl fmt::Display for ResumeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeDecision::Choice(option) => write!(f, "{option}"),
            ResumeDecision::Raw(value) => write!(f, "{value}"),
        }
    }
}

/// Session fields an approver may edit alongside any decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    /// Appended to the conversation.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Recorded as warnings attributed to the approver.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Replacement task payloads, keyed by capability name.
    #[serde(default)]
    pub task_overrides: BTreeMap<String, serde_json::Value>,
}

impl StatePatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.warnings.is_empty() && self.task_overrides.is_empty()
    }
}

/// The reviewer's answer to an [`InterruptRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeCommand {
    /// The interrupt being answered.
    pub interrupt_id: String,
    /// The approver's decision, typed or raw.
    pub decision: ResumeDecision,
    /// Merged into the session with the decision.
    #[serde(default)]
    pub state_patch: Option<StatePatch>,
    /// Recorded as the origin of the approver's message.
    #[serde(default)]
    pub reviewer: Option<String>,
}

impl ResumeCommand {
    /// A command answering `interrupt_id` with `decision`.
    pub fn new(interrupt_id: impl Into<String>, decision: impl Into<ResumeDecision>) -> Self {
        Self {
            interrupt_id: interrupt_id.into(),
            decision: decision.into(),
            state_patch: None,
            reviewer: None,
        }
    }

    /// Attach a state patch.
    pub fn with_patch(mut self, patch: StatePatch) -> Self {
        self.state_patch = Some(patch);
        self
    }

    /// Name the reviewer.
    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = Some(reviewer.into());
        self
    }
}
