//! Plan construction: requested capabilities grouped into dependency levels,
//! one step per level, with approval gates and complexity-scaled timeouts.

use crate::registry::CapabilityRegistry;
use std::collections::{BTreeSet, HashMap};
use stepflow_core::{ApprovalMode, Intent, Plan, PlanningError, Step};
use tracing::debug;

/// Builds dependency-ordered plans from an analyzed intent.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    /// Decides which steps wait for approval.
    pub approval_mode: ApprovalMode,
    /// Ceiling for any step timeout.
    pub max_step_timeout_ms: u64,
    /// Retries granted to each invocation of a step.
    pub retry_budget: u32,
}

impl PlanBuilder {
    /// A builder applying `approval_mode` and the step limits to every plan.
    pub fn new(approval_mode: ApprovalMode, max_step_timeout_ms: u64, retry_budget: u32) -> Self {
        Self {
            approval_mode,
            max_step_timeout_ms,
            retry_budget,
        }
    }

    /// Group the requested capabilities into steps by dependency level.
    ///
    /// Each step holds every capability whose in-request dependencies are all
    /// in earlier steps, in request order. Dependencies outside the request
    /// are ignored, but must still be registered.
    pub fn build(
        &self,
        intent: &Intent,
        registry: &CapabilityRegistry,
        iteration: u32,
    ) -> Result<Plan, PlanningError> {
        let mut requested: Vec<String> = Vec::new();
        for name in &intent.capabilities {
            if !requested.contains(name) {
                requested.push(name.clone());
            }
        }
        if requested.is_empty() {
            return Err(PlanningError::EmptyIntent);
        }

        let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &requested {
            let descriptor = registry
                .descriptor(name)
                .ok_or_else(|| PlanningError::UnknownCapability(name.clone()))?;
            let mut in_request = Vec::new();
            for dep in &descriptor.depends_on {
                if !registry.contains(dep) {
                    return Err(PlanningError::UnknownCapability(dep.clone()));
                }
                if requested.contains(dep) && dep != name && !in_request.contains(&dep.as_str()) {
                    in_request.push(dep.as_str());
                }
                if dep == name {
                    return Err(PlanningError::Cycle(vec![name.clone()]));
                }
            }
            deps.insert(name.as_str(), in_request);
        }

        let mut in_degree: HashMap<&str, usize> = requested
            .iter()
            .map(|n| (n.as_str(), deps[n.as_str()].len()))
            .collect();
        let mut levels: Vec<Vec<&str>> = Vec::new();
        let mut placed: BTreeSet<&str> = BTreeSet::new();

        while placed.len() < requested.len() {
            let frontier: Vec<&str> = requested
                .iter()
                .map(String::as_str)
                .filter(|n| !placed.contains(n) && in_degree[n] == 0)
                .collect();
            if frontier.is_empty() {
                let stuck = requested
                    .iter()
                    .filter(|n| !placed.contains(n.as_str()))
                    .cloned()
                    .collect();
                return Err(PlanningError::Cycle(stuck));
            }
            for node in &frontier {
                placed.insert(node);
                for (dependent, its_deps) in &deps {
                    if its_deps.contains(node) {
                        if let Some(d) = in_degree.get_mut(dependent) {
                            *d -= 1;
                        }
                    }
                }
            }
            levels.push(frontier);
        }

        let mut step_of: HashMap<&str, String> = HashMap::new();
        let mut steps = Vec::with_capacity(levels.len());
        for (index, level) in levels.iter().enumerate() {
            let step_id = format!("step_{}", index + 1);
            let dependencies: BTreeSet<String> = level
                .iter()
                .flat_map(|n| deps[n].iter())
                .filter_map(|d| step_of.get(d).cloned())
                .collect();

            let descriptors: Vec<_> = level
                .iter()
                .filter_map(|n| registry.descriptor(n))
                .collect();
            let base_ms = descriptors
                .iter()
                .map(|d| d.base_timeout_secs.saturating_mul(1000))
                .max()
                .unwrap_or(0);
            let scaled = (base_ms as f64 * (1.0 + intent.complexity.clamp(0.0, 1.0))).round();
            let timeout_ms = (scaled as u64).min(self.max_step_timeout_ms).max(1);

            let requires_approval = match self.approval_mode {
                ApprovalMode::All => true,
                ApprovalMode::CriticalOnly => descriptors.iter().any(|d| d.critical),
                ApprovalMode::None => false,
            };

            let description = descriptors
                .iter()
                .map(|d| {
                    if d.description.is_empty() {
                        d.name.clone()
                    } else {
                        format!("{}: {}", d.name, d.description)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");

            for name in level {
                step_of.insert(name, step_id.clone());
            }
            steps.push(Step {
                step_id,
                capability_names: level.iter().map(|n| n.to_string()).collect(),
                dependencies,
                requires_approval,
                timeout_ms,
                retry_budget: self.retry_budget,
                description,
            });
        }

        debug!(
            steps = steps.len(),
            capabilities = requested.len(),
            iteration,
            "Built plan"
        );
        Ok(Plan::new(iteration, steps, requested))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use stepflow_core::{
        Capability, CapabilityDescriptor, CapabilityFailure, CapabilityOutput, TaskDescriptor,
    };

    struct Stub(CapabilityDescriptor);

    #[async_trait]
    impl Capability for Stub {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.0
        }

        async fn invoke(&self, _: TaskDescriptor) -> Result<CapabilityOutput, CapabilityFailure> {
            Ok(CapabilityOutput::new(serde_json::Value::Null, 1.0))
        }
    }

    fn registry(descriptors: Vec<CapabilityDescriptor>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        for d in descriptors {
            registry.register(Arc::new(Stub(d)));
        }
        registry
    }

    /// The five-capability catalog dependency table.
    fn catalog() -> CapabilityRegistry {
        registry(vec![
            CapabilityDescriptor::new("data_analysis").with_base_timeout_secs(30),
            CapabilityDescriptor::new("information_retrieval").with_base_timeout_secs(20),
            CapabilityDescriptor::new("document_generation")
                .depends_on(["data_analysis", "information_retrieval"])
                .critical(true)
                .with_base_timeout_secs(25),
            CapabilityDescriptor::new("compliance_validation")
                .depends_on(["document_generation"])
                .with_base_timeout_secs(15),
            CapabilityDescriptor::new("storage_decision")
                .depends_on(["data_analysis", "document_generation"])
                .critical(true)
                .with_base_timeout_secs(10),
        ])
    }

    fn builder() -> PlanBuilder {
        PlanBuilder::new(ApprovalMode::CriticalOnly, 120_000, 1)
    }

    #[test]
    fn test_full_catalog_levels() {
        let intent = Intent::new(
            "q",
            [
                "storage_decision",
                "compliance_validation",
                "document_generation",
                "information_retrieval",
                "data_analysis",
            ],
        );
        let plan = builder().build(&intent, &catalog(), 1).unwrap();
        let levels: Vec<Vec<&str>> = plan
            .steps
            .iter()
            .map(|s| s.capability_names.iter().map(String::as_str).collect())
            .collect();
        assert_eq!(
            levels,
            vec![
                vec!["information_retrieval", "data_analysis"],
                vec!["document_generation"],
                vec!["storage_decision", "compliance_validation"],
            ]
        );
        assert!(plan.is_topologically_ordered());
        assert_eq!(
            plan.steps[2].dependencies,
            BTreeSet::from(["step_1".to_string(), "step_2".to_string()])
        );
        assert!(!plan.steps[0].requires_approval);
        assert!(plan.steps[1].requires_approval);
    }

    #[test]
    fn test_dependencies_outside_request_are_ignored() {
        let intent = Intent::new("q", ["document_generation"]);
        let plan = builder().build(&intent, &catalog(), 1).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].dependencies.is_empty());
    }

    #[test]
    fn test_timeout_scales_with_complexity_and_caps() {
        let intent = Intent::new("q", ["data_analysis", "information_retrieval"]).with_complexity(0.5);
        let plan = builder().build(&intent, &catalog(), 1).unwrap();
        assert_eq!(plan.steps[0].timeout_ms, 45_000);

        let capped = PlanBuilder::new(ApprovalMode::None, 40_000, 0)
            .build(&intent, &catalog(), 1)
            .unwrap();
        assert_eq!(capped.steps[0].timeout_ms, 40_000);
    }

    #[test]
    fn test_approval_modes() {
        let intent = Intent::new("q", ["data_analysis"]);
        let all = PlanBuilder::new(ApprovalMode::All, 120_000, 1)
            .build(&intent, &catalog(), 1)
            .unwrap();
        assert!(all.steps[0].requires_approval);

        let intent = Intent::new("q", ["storage_decision"]);
        let none = PlanBuilder::new(ApprovalMode::None, 120_000, 1)
            .build(&intent, &catalog(), 1)
            .unwrap();
        assert!(!none.steps[0].requires_approval);
    }

    #[test]
    fn test_planning_errors() {
        let err = builder()
            .build(&Intent::new("q", Vec::<String>::new()), &catalog(), 1)
            .unwrap_err();
        assert_eq!(err, PlanningError::EmptyIntent);

        let err = builder()
            .build(&Intent::new("q", ["ghost"]), &catalog(), 1)
            .unwrap_err();
        assert_eq!(err, PlanningError::UnknownCapability("ghost".into()));

        let dangling = registry(vec![CapabilityDescriptor::new("a").depends_on(["missing"])]);
        let err = builder()
            .build(&Intent::new("q", ["a"]), &dangling, 1)
            .unwrap_err();
        assert_eq!(err, PlanningError::UnknownCapability("missing".into()));
    }

    #[test]
    fn test_cycle_detection() {
        let cyclic = registry(vec![
            CapabilityDescriptor::new("a").depends_on(["c"]),
            CapabilityDescriptor::new("b").depends_on(["a"]),
            CapabilityDescriptor::new("c").depends_on(["b"]),
            CapabilityDescriptor::new("d"),
        ]);
        let err = builder()
            .build(&Intent::new("q", ["d", "a", "b", "c"]), &cyclic, 1)
            .unwrap_err();
        assert_eq!(
            err,
            PlanningError::Cycle(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_duplicates_first_appearance_wins() {
        let intent = Intent::new("q", ["data_analysis", "information_retrieval", "data_analysis"]);
        let plan = builder().build(&intent, &catalog(), 1).unwrap();
        assert_eq!(plan.requested, vec!["data_analysis", "information_retrieval"]);
        assert_eq!(plan.steps[0].step_id, "step_1");
    }
}
