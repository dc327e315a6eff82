use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use stepflow_core::{
    Capability, CapabilityDescriptor, CapabilityFailure, CapabilityOutput, FailureKind,
    TaskDescriptor,
};
use tracing::debug;

fn default_base_timeout_secs() -> u64 {
    20
}
fn default_confidence() -> f64 {
    0.9
}
fn default_failure_kind() -> FailureKind {
    FailureKind::Transient
}

/// Declarative behavior of a [`ScriptedCapability`].
///
/// Loaded from configuration so the engine can run end-to-end without real
/// workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedSpec {
    /// Registry key.
    pub name: String,
    /// Shown in listings.
    #[serde(default)]
    pub description: String,
    /// Capabilities whose outputs this one consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Critical capabilities are gated in `critical-only` mode.
    #[serde(default)]
    pub critical: bool,
    /// Timeout budget for a zero-complexity request, in seconds.
    #[serde(default = "default_base_timeout_secs")]
    pub base_timeout_secs: u64,
    /// Simulated work per attempt.
    #[serde(default)]
    pub latency_ms: u64,
    /// Confidence reported on success.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// The first `fail_attempts` invocations fail with `failure_kind`.
    #[serde(default)]
    pub fail_attempts: u32,
    /// Kind of the scripted failures.
    #[serde(default = "default_failure_kind")]
    pub failure_kind: FailureKind,
    /// Returned as-is when set; otherwise a summary of the task is returned.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Tokens reported on success.
    #[serde(default)]
    pub tokens: u64,
    /// Capabilities that can replace this one after it fails.
    #[serde(default)]
    pub alternatives: Vec<String>,
}

impl ScriptedSpec {
    /// A spec that succeeds immediately with confidence 0.9.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            critical: false,
            base_timeout_secs: default_base_timeout_secs(),
            latency_ms: 0,
            confidence: default_confidence(),
            fail_attempts: 0,
            failure_kind: default_failure_kind(),
            payload: None,
            tokens: 0,
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

    /// Sleep this long on every attempt.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set the confidence reported on success.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Fail the first `attempts` invocations with `kind`.
    pub fn failing(mut self, attempts: u32, kind: FailureKind) -> Self {
        self.fail_attempts = attempts;
        self.failure_kind = kind;
        self
    }

    /// Return `payload` instead of a task summary.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Report `tokens` on success.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
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

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(self.name.clone())
            .with_description(self.description.clone())
            .depends_on(self.depends_on.iter().cloned())
            .critical(self.critical)
            .with_base_timeout_secs(self.base_timeout_secs)
            .with_alternatives(self.alternatives.iter().cloned())
    }
}

/// A capability whose latency, confidence and failures are scripted.
pub struct ScriptedCapability {
    descriptor: CapabilityDescriptor,
    spec: ScriptedSpec,
    calls: AtomicU32,
}

impl ScriptedCapability {
    /// A capability behaving as `spec` describes.
    pub fn new(spec: ScriptedSpec) -> Self {
        Self {
            descriptor: spec.descriptor(),
            spec,
            calls: AtomicU32::new(0),
        }
    }

    /// Invocations so far, including failed attempts.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// The spec this capability was built from.
    pub fn spec(&self) -> &ScriptedSpec {
        &self.spec
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, task: TaskDescriptor) -> Result<CapabilityOutput, CapabilityFailure> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            capability = %self.spec.name,
            session_id = %task.session_context.session_id,
            step_id = %task.session_context.step_id,
            attempt,
            "Scripted invocation"
        );

        if self.spec.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.spec.latency_ms)).await;
        }

        if attempt <= self.spec.fail_attempts {
            return Err(CapabilityFailure::new(
                self.spec.failure_kind,
                format!("{} failed on attempt {attempt}", self.spec.name),
            ));
        }

        let payload = match &self.spec.payload {
            Some(payload) => payload.clone(),
            None => serde_json::json!({
                "capability": self.spec.name,
                "task": task.task_payload,
                "inputs": task.session_context.upstream.keys().collect::<Vec<_>>(),
                "iteration": task.session_context.iteration,
            }),
        };
        Ok(CapabilityOutput::new(payload, self.spec.confidence).with_tokens(self.spec.tokens))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stepflow_core::SessionContext;

    fn task(upstream: BTreeMap<String, serde_json::Value>) -> TaskDescriptor {
        TaskDescriptor {
            capability_name: "report".into(),
            task_payload: serde_json::json!({"query": "q"}),
            session_context: SessionContext {
                session_id: "s-1".into(),
                user_query: "q".into(),
                iteration: 2,
                step_id: "step_1".into(),
                upstream,
            },
        }
    }

    #[tokio::test]
    async fn test_fails_then_succeeds() {
        let cap = ScriptedCapability::new(
            ScriptedSpec::new("report").failing(2, FailureKind::Timeout),
        );
        for _ in 0..2 {
            let err = cap.invoke(task(BTreeMap::new())).await.unwrap_err();
            assert_eq!(err.kind, FailureKind::Timeout);
        }
        let out = cap.invoke(task(BTreeMap::new())).await.unwrap();
        assert_eq!(out.payload["capability"], "report");
        assert_eq!(out.payload["iteration"], 2);
        assert_eq!(cap.calls(), 3);
    }

    #[tokio::test]
    async fn test_default_payload_lists_upstream_inputs() {
        let cap = ScriptedCapability::new(ScriptedSpec::new("report").with_tokens(7));
        let upstream = BTreeMap::from([("data_analysis".to_string(), serde_json::json!(1))]);
        let out = cap.invoke(task(upstream)).await.unwrap();
        assert_eq!(out.payload["inputs"], serde_json::json!(["data_analysis"]));
        assert_eq!(out.tokens_used, 7);
    }

    #[test]
    fn test_spec_deserialization_uses_defaults() {
        let spec: ScriptedSpec = serde_json::from_value(serde_json::json!({
            "name": "lookup",
            "depends_on": ["a"],
            "failure_kind": "validation",
        }))
        .unwrap();
        assert_eq!(spec.base_timeout_secs, 20);
        assert_eq!(spec.confidence, 0.9);
        assert_eq!(spec.failure_kind, FailureKind::Validation);

        let cap = ScriptedCapability::new(spec);
        assert_eq!(cap.descriptor().depends_on, vec!["a".to_string()]);
    }
}
