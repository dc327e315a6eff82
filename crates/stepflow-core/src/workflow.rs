//! Value types that flow through one workflow iteration: the analyzed
//! [`Intent`], the [`Plan`] built from it and the [`Evaluation`] of its results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// What the user asked for, as understood by the intent analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// The analyzed query.
    pub query: String,
    /// Requested capabilities, in the order they were recognized.
    pub capabilities: Vec<String>,
    /// Request complexity in `0.0..=1.0`; scales step timeouts.
    pub complexity: f64,
    /// Vague terms found in the query.
    #[serde(default)]
    pub ambiguities: Vec<String>,
    /// Set when ambiguities were found.
    #[serde(default)]
    pub clarification_needed: bool,
}

impl Intent {
    /// An intent requesting `capabilities`, with zero complexity.
    pub fn new<I, S>(query: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query: query.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            complexity: 0.0,
            ambiguities: Vec::new(),
            clarification_needed: false,
        }
    }

    /// Set the complexity, clamped to `0.0..=1.0`.
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity.clamp(0.0, 1.0);
        self
    }

    /// A copy of this intent with the given capabilities removed.
    pub fn without(&self, excluded: &BTreeSet<String>) -> Self {
        let mut next = self.clone();
        next.capabilities.retain(|c| !excluded.contains(c));
        next
    }

    /// A copy of this intent with `failed` replaced in place by
    /// `alternative`. Unchanged when `failed` was not requested.
    pub fn substitute(&self, failed: &str, alternative: &str) -> Self {
        let mut next = self.clone();
        if let Some(slot) = next.capabilities.iter_mut().find(|c| c.as_str() == failed) {
            *slot = alternative.to_string();
        }
        let mut seen = BTreeSet::new();
        next.capabilities.retain(|c| seen.insert(c.clone()));
        next
    }
}

/// A unit of execution: one capability, or several run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// `step_<n>`, unique within the plan.
    pub step_id: String,
    /// Capabilities run by this step.
    pub capability_names: Vec<String>,
    /// Steps that must complete before this one starts.
    pub dependencies: BTreeSet<String>,
    /// Whether an approver must decide before the step runs.
    pub requires_approval: bool,
    /// Deadline for the whole step, retries included.
    pub timeout_ms: u64,
    /// Retries granted to each invocation.
    pub retry_budget: u32,
    /// Human-readable summary.
    #[serde(default)]
    pub description: String,
}

impl Step {
    /// Whether the step runs more than one capability.
    pub fn is_parallel(&self) -> bool {
        self.capability_names.len() > 1
    }
}

/// An ordered, dependency-respecting list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique per plan build or reissue.
    pub plan_id: String,
    /// Iteration this plan executes in.
    pub iteration: u32,
    /// Steps in execution order.
    pub steps: Vec<Step>,
    /// The capabilities the plan was built for, deduplicated in request order.
    #[serde(default)]
    pub requested: Vec<String>,
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::empty()
    }
}

impl Plan {
    /// A plan for `iteration` with a fresh id.
    pub fn new(iteration: u32, steps: Vec<Step>, requested: Vec<String>) -> Self {
        Self {
            plan_id: Uuid::new_v4().to_string(),
            iteration,
            steps,
            requested,
            created_at: Utc::now(),
        }
    }

    /// The placeholder plan held before planning has run.
    pub fn empty() -> Self {
        Self::new(0, Vec::new(), Vec::new())
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Every step appears after all of its dependencies.
    pub fn is_topologically_ordered(&self) -> bool {
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !step.dependencies.iter().all(|d| seen.contains(d.as_str())) {
                return false;
            }
            seen.insert(step.step_id.as_str());
        }
        true
    }

    /// All capabilities of the plan, in step order.
    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|s| s.capability_names.iter().map(String::as_str))
    }

    /// The same steps, re-issued for another iteration.
    pub fn reissue(&self, iteration: u32) -> Self {
        Self::new(iteration, self.steps.clone(), self.requested.clone())
    }
}

/// What the iteration controller decided after a plan ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The score met the threshold.
    Finish,
    /// Every failure was transient; run the same plan again.
    RetryPlan,
    /// Analyze the failures and build a different plan.
    NewPlan,
    /// Give up; the session fails.
    Fail,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Finish => "finish",
            Decision::RetryPlan => "retry_plan",
            Decision::NewPlan => "new_plan",
            Decision::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// The evaluator's verdict on one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// What happens next.
    pub decision: Decision,
    /// Weighted score in `0.0..=1.0`.
    pub score: f64,
    /// Why the decision was made.
    pub reason: String,
    /// Iteration that was evaluated.
    pub iteration: u32,
    /// When the evaluation ran.
    pub at: DateTime<Utc>,
}

impl Evaluation {
    /// An evaluation stamped now.
    pub fn new(decision: Decision, score: f64, reason: impl Into<String>, iteration: u32) -> Self {
        Self {
            decision,
            score,
            reason: reason.into(),
            iteration,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn step(id: &str, caps: &[&str], deps: &[&str]) -> Step {
        Step {
            step_id: id.into(),
            capability_names: caps.iter().map(|c| c.to_string()).collect(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            requires_approval: false,
            timeout_ms: 1000,
            retry_budget: 0,
            description: String::new(),
        }
    }

    #[test]
    fn test_topological_order_check() {
        let ordered = Plan::new(
            1,
            vec![step("step_1", &["a", "b"], &[]), step("step_2", &["c"], &["step_1"])],
            vec!["a".into(), "b".into(), "c".into()],
        );
        assert!(ordered.is_topologically_ordered());
        assert!(ordered.steps[0].is_parallel());
        assert_eq!(ordered.capability_names().collect::<Vec<_>>(), ["a", "b", "c"]);

        let reversed = Plan::new(
            1,
            vec![step("step_2", &["c"], &["step_1"]), step("step_1", &["a"], &[])],
            vec![],
        );
        assert!(!reversed.is_topologically_ordered());
    }

    #[test]
    fn test_reissue_keeps_steps_with_fresh_id() {
        let plan = Plan::new(1, vec![step("step_1", &["a"], &[])], vec!["a".into()]);
        let next = plan.reissue(2);
        assert_eq!(next.steps, plan.steps);
        assert_eq!(next.iteration, 2);
        assert_ne!(next.plan_id, plan.plan_id);
    }

    #[test]
    fn test_intent_without() {
        let intent = Intent::new("q", ["a", "ghost", "b"]).with_complexity(1.4);
        assert_eq!(intent.complexity, 1.0);
        let excluded = BTreeSet::from(["ghost".to_string()]);
        assert_eq!(intent.without(&excluded).capabilities, vec!["a", "b"]);
    }

    #[test]
    fn test_intent_substitute() {
        let intent = Intent::new("q", ["a", "b", "c"]);
        assert_eq!(intent.substitute("b", "x").capabilities, vec!["a", "x", "c"]);
        assert_eq!(intent.substitute("b", "c").capabilities, vec!["a", "c"]);
        assert_eq!(intent.substitute("ghost", "x").capabilities, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_decision_serde() {
        assert_eq!(serde_json::to_string(&Decision::RetryPlan).unwrap(), "\"retry_plan\"");
        assert_eq!(Decision::NewPlan.to_string(), "new_plan");
    }
}
