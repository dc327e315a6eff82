//! The capability invocation contract.
//!
//! A capability is a named worker the engine can invoke. The engine knows
//! nothing about what it does; it hands over a [`TaskDescriptor`] and gets back
//! either a [`CapabilityOutput`] or a [`CapabilityFailure`], which the
//! dispatcher turns into an immutable [`CapabilityResult`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome class of one capability invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    /// The worker returned an output.
    Success,
    /// The worker failed or was never reached.
    Failed,
    /// The step deadline passed first.
    Timeout,
}

/// Classification of a failed invocation, used by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worker-reported error that may succeed on retry (rate limits, 5xx, ...).
    Transient,
    /// The invocation exceeded the step timeout.
    Timeout,
    /// The worker rejected its input.
    Validation,
    /// An upstream output the worker needs is missing.
    MissingInput,
    /// The capability cannot be reached or does not exist.
    Unavailable,
    /// The worker panicked.
    Internal,
    /// The worker reported an unrecoverable error for the whole session.
    Fatal,
    /// The invocation was canceled before completing.
    Canceled,
    /// An approver rejected the step owning this invocation.
    Rejected,
}

impl FailureKind {
    /// Timeouts and transient worker errors are worth retrying as-is.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Timeout)
    }

    /// The plan itself was wrong: a capability is missing or cannot be fed.
    pub fn is_structural(self) -> bool {
        matches!(self, FailureKind::Unavailable | FailureKind::MissingInput)
    }

    /// Fatal failures end the session.
    pub fn is_fatal(self) -> bool {
        matches!(self, FailureKind::Fatal)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Timeout => "timeout",
            FailureKind::Validation => "validation",
            FailureKind::MissingInput => "missing_input",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Internal => "internal",
            FailureKind::Fatal => "fatal",
            FailureKind::Canceled => "canceled",
            FailureKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Error reported by (or on behalf of) a capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFailure {
    /// Classification used by the evaluator.
    pub kind: FailureKind,
    /// Worker-supplied description.
    pub message: String,
}

impl CapabilityFailure {
    /// A failure of `kind`.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A [`FailureKind::Transient`] failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// A [`FailureKind::Validation`] failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// A [`FailureKind::Fatal`] failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }
}

impl fmt::Display for CapabilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CapabilityFailure {}

/// What a capability hands back on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    /// Worker output, recorded as-is.
    pub payload: serde_json::Value,
    /// Self-reported confidence, clamped to `0.0..=1.0` when recorded.
    pub confidence: f64,
    /// Tokens the invocation consumed.
    #[serde(default)]
    pub tokens_used: u64,
}

impl CapabilityOutput {
    /// An output with no token usage.
    pub fn new(payload: serde_json::Value, confidence: f64) -> Self {
        Self {
            payload,
            confidence,
            tokens_used: 0,
        }
    }

    /// Report token usage.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Read-only view of the session handed to every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Session being served.
    pub session_id: String,
    /// The query that started the session.
    pub user_query: String,
    /// Current iteration.
    pub iteration: u32,
    /// The step this invocation belongs to.
    pub step_id: String,
    /// Payloads of the successful upstream capabilities this one depends on.
    #[serde(default)]
    pub upstream: BTreeMap<String, serde_json::Value>,
}

/// Input of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Capability being invoked.
    pub capability_name: String,
    /// The task: the user query, or an approver override.
    pub task_payload: serde_json::Value,
    /// Context the capability may read.
    pub session_context: SessionContext,
}

/// Static description of a capability, registered once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique registry key.
    pub name: String,
    /// Shown in listings.
    #[serde(default)]
    pub description: String,
    /// Capabilities whose outputs this one consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Critical capabilities require approval in `critical-only` mode.
    #[serde(default)]
    pub critical: bool,
    /// Timeout budget for a zero-complexity request, in seconds.
    #[serde(default = "default_base_timeout_secs")]
    pub base_timeout_secs: u64,
    /// Capabilities that can stand in for this one when it fails, in order
    /// of preference.
    #[serde(default)]
    pub alternatives: Vec<String>,
}

fn default_base_timeout_secs() -> u64 {
    20
}

impl CapabilityDescriptor {
    /// A descriptor with no dependencies, not critical, default timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            critical: false,
            base_timeout_secs: default_base_timeout_secs(),
            alternatives: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the capabilities whose outputs this one consumes.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the capability critical.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set the zero-complexity timeout.
    pub fn with_base_timeout_secs(mut self, secs: u64) -> Self {
        self.base_timeout_secs = secs;
        self
    }

    /// Set the capabilities that can replace this one after a failure.
    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives = alternatives.into_iter().map(Into::into).collect();
        self
    }
}

/// A worker the engine can invoke.
///
/// Implementations must be idempotent for a repeated `task_payload`: the
/// dispatcher retries transient failures and the evaluator may re-run a whole
/// plan.
#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    async fn invoke(&self, task: TaskDescriptor) -> Result<CapabilityOutput, CapabilityFailure>;
}

/// Output of one capability invocation, as recorded in the session.
///
/// `error` is present iff `status` is not [`CapabilityStatus::Success`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResult {
    /// Capability that produced the result.
    pub capability_name: String,
    /// Success, failure or timeout.
    pub status: CapabilityStatus,
    /// Output payload; `null` on failure.
    pub payload: serde_json::Value,
    /// Confidence in `0.0..=1.0`; zero on failure.
    pub confidence: f64,
    /// Set when the invocation did not succeed.
    pub error: Option<CapabilityFailure>,
    /// Iteration the invocation ran in.
    pub iteration: u32,
    /// Step the invocation ran in.
    pub step_id: String,
    /// Attempts made, including retries.
    pub attempts: u32,
    /// Tokens reported by the worker.
    #[serde(default)]
    pub tokens_used: u64,
    /// When the first attempt started.
    pub started_at: DateTime<Utc>,
    /// When the last attempt ended.
    pub finished_at: DateTime<Utc>,
    /// Wall time across attempts.
    pub duration_ms: u64,
}

impl CapabilityResult {
    /// A successful invocation.
    pub fn success(
        capability_name: impl Into<String>,
        output: CapabilityOutput,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            capability_name: capability_name.into(),
            status: CapabilityStatus::Success,
            payload: output.payload,
            confidence: clamp_confidence(output.confidence),
            error: None,
            iteration: 0,
            step_id: String::new(),
            attempts: 1,
            tokens_used: output.tokens_used,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
        }
    }

    /// A failed invocation. Timeouts get [`CapabilityStatus::Timeout`].
    pub fn failure(
        capability_name: impl Into<String>,
        failure: CapabilityFailure,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let status = if failure.kind == FailureKind::Timeout {
            CapabilityStatus::Timeout
        } else {
            CapabilityStatus::Failed
        };
        Self {
            capability_name: capability_name.into(),
            status,
            payload: serde_json::Value::Null,
            confidence: 0.0,
            error: Some(failure),
            iteration: 0,
            step_id: String::new(),
            attempts: 1,
            tokens_used: 0,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
        }
    }

    /// Tag the result with the step and iteration that produced it.
    pub fn in_step(mut self, step_id: impl Into<String>, iteration: u32) -> Self {
        self.step_id = step_id.into();
        self.iteration = iteration;
        self
    }

    /// Record the attempts made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.status == CapabilityStatus::Success
    }

    /// The failure kind, `None` on success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
