use std::collections::HashMap;
use std::sync::Arc;
use stepflow_core::{Capability, CapabilityDescriptor};
use tracing::info;

/// Static map from capability name to its implementation.
///
/// Built once at startup and shared read-only by the planner and dispatcher.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability, replacing any previous one with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.descriptor().name.clone();
        info!(capability = %name, "Registered capability");
        self.capabilities.insert(name, capability);
    }

    /// The implementation registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    /// Descriptor of the capability registered under `name`.
    pub fn descriptor(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.capabilities.get(name).map(|c| c.descriptor())
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Descriptors sorted by name.
    pub fn list_descriptors(&self) -> Vec<&CapabilityDescriptor> {
        let mut descriptors: Vec<_> = self.capabilities.values().map(|c| c.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether no capability is registered.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stepflow_core::{CapabilityFailure, CapabilityOutput, TaskDescriptor};

    struct Noop(CapabilityDescriptor);

    #[async_trait]
    impl Capability for Noop {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.0
        }

        async fn invoke(&self, _: TaskDescriptor) -> Result<CapabilityOutput, CapabilityFailure> {
            Ok(CapabilityOutput::new(serde_json::Value::Null, 1.0))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(Noop(CapabilityDescriptor::new("b"))));
        registry.register(Arc::new(Noop(
            CapabilityDescriptor::new("a").depends_on(["b"]),
        )));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert!(registry.get("ghost").is_none());
        assert_eq!(registry.descriptor("a").unwrap().depends_on, vec!["b"]);
        let names: Vec<_> = registry
            .list_descriptors()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }
}
