use serde::{Deserialize, Serialize};
use stepflow_core::{ApprovalMode, DecisionOption, StepflowError, StepflowResult};
use stepflow_session::LogCaps;

/// Configures retry behaviour with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `backoff_max_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }

    /// [`Self::backoff_ms`] as a `Duration`.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_ms(attempt))
    }
}

fn default_max_iterations() -> u32 {
    3
}
fn default_quality_threshold() -> f64 {
    0.7
}
fn default_max_parallel() -> usize {
    8
}
fn default_max_step_timeout_ms() -> u64 {
    120_000
}
fn default_interrupt_timeout_ms() -> u64 {
    300_000
}
fn default_on_timeout() -> DecisionOption {
    DecisionOption::Approve
}
fn default_weight() -> f64 {
    0.5
}
fn default_invocation_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        backoff_base_ms: 50,
        backoff_max_ms: 1_000,
    }
}

/// Tunables of the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on plan iterations per session.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Evaluation score at or above which a session finishes.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Which steps wait for approval.
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Concurrent capability invocations across all sessions.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Cap on a step's complexity-scaled timeout.
    #[serde(default = "default_max_step_timeout_ms")]
    pub max_step_timeout_ms: u64,
    /// `max_retries` becomes every step's retry budget.
    #[serde(default = "default_invocation_retry")]
    pub invocation_retry: RetryPolicy,
    /// Bounded retries for checkpoint writes.
    #[serde(default)]
    pub checkpoint_retry: RetryPolicy,
    /// Prune superseded checkpoints down to this many per session.
    #[serde(default)]
    pub checkpoint_keep_latest: Option<usize>,
    /// How long an approval interrupt stays open.
    #[serde(default = "default_interrupt_timeout_ms")]
    pub interrupt_timeout_ms: u64,
    /// Applied when an approval interrupt expires.
    #[serde(default = "default_on_timeout")]
    pub default_on_timeout: DecisionOption,
    /// Weight of the success rate in the evaluation score.
    #[serde(default = "default_weight")]
    pub success_weight: f64,
    /// Weight of the mean success confidence in the evaluation score.
    #[serde(default = "default_weight")]
    pub confidence_weight: f64,
    /// Caps on the session's append-only logs.
    #[serde(default)]
    pub log_caps: LogCaps,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            approval_mode: ApprovalMode::default(),
            max_parallel: default_max_parallel(),
            max_step_timeout_ms: default_max_step_timeout_ms(),
            invocation_retry: default_invocation_retry(),
            checkpoint_retry: RetryPolicy::default(),
            checkpoint_keep_latest: None,
            interrupt_timeout_ms: default_interrupt_timeout_ms(),
            default_on_timeout: default_on_timeout(),
            success_weight: default_weight(),
            confidence_weight: default_weight(),
            log_caps: LogCaps::default(),
        }
    }
}

impl EngineConfig {
    /// Reject weights, thresholds and budgets outside their valid ranges.
    pub fn validate(&self) -> StepflowResult<()> {
        if self.max_iterations == 0 {
            return Err(StepflowError::Config("max_iterations must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(StepflowError::Config(format!(
                "quality_threshold must be within 0.0..=1.0, got {}",
                self.quality_threshold
            )));
        }
        if self.max_parallel == 0 {
            return Err(StepflowError::Config("max_parallel must be at least 1".into()));
        }
        if self.success_weight < 0.0
            || self.confidence_weight < 0.0
            || self.success_weight + self.confidence_weight <= 0.0
        {
            return Err(StepflowError::Config(
                "evaluation weights must be non-negative and not both zero".into(),
            ));
        }
        if self.checkpoint_keep_latest == Some(0) {
            return Err(StepflowError::Config(
                "checkpoint_keep_latest must keep at least one checkpoint".into(),
            ));
        }
        Ok(())
    }
}
