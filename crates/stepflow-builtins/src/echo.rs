use async_trait::async_trait;
use stepflow_core::{
    Capability, CapabilityDescriptor, CapabilityFailure, CapabilityOutput, TaskDescriptor,
};

/// Returns its task payload and upstream inputs unchanged.
pub struct EchoCapability {
    descriptor: CapabilityDescriptor,
    confidence: f64,
}

impl EchoCapability {
    /// An echo capability named `echo`.
    pub fn new() -> Self {
        Self::named("echo")
    }

    /// An echo capability registered under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(name)
                .with_description("Echo the task payload back")
                .with_base_timeout_secs(5),
            confidence: 1.0,
        }
    }

    /// Confidence reported with every output.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

impl Default for EchoCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for EchoCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, task: TaskDescriptor) -> Result<CapabilityOutput, CapabilityFailure> {
        if task.task_payload.is_null() {
            return Err(CapabilityFailure::validation("empty task payload"));
        }
        Ok(CapabilityOutput::new(
            serde_json::json!({
                "echo": task.task_payload,
                "upstream": task.session_context.upstream,
            }),
            self.confidence,
        ))
    }
}
