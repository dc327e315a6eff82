//! Iteration scoring.
//!
//! The score blends the fraction of planned capabilities that succeeded with
//! the mean confidence of those successes. The decision (finish, retry the
//! same plan, plan again or fail) follows from the score, the failure kinds
//! and the remaining iteration budget.

use stepflow_core::{CapabilityResult, Decision, Evaluation, FailureKind, Plan, StepflowError};
use stepflow_session::Session;
use tracing::debug;

/// Scores an iteration's results and decides what happens next.
#[derive(Debug, Clone)]
pub struct Evaluator {
    /// Minimum score that finishes a session.
    pub quality_threshold: f64,
    /// Iteration budget per session.
    pub max_iterations: u32,
    /// Weight of the success rate in the score.
    pub success_weight: f64,
    /// Weight of the mean success confidence in the score.
    pub confidence_weight: f64,
}

impl Evaluator {
    /// An evaluator; the two weights are expected to sum to 1.
    pub fn new(
        quality_threshold: f64,
        max_iterations: u32,
        success_weight: f64,
        confidence_weight: f64,
    ) -> Self {
        Self {
            quality_threshold,
            max_iterations,
            success_weight,
            confidence_weight,
        }
    }

    /// Evaluate the results `plan` produced in its iteration.
    ///
    /// Decision order: fatal failure, threshold reached, budget exhausted,
    /// structural failure, all-transient failures, anything else.
    pub fn evaluate(&self, session: &Session, plan: &Plan) -> Evaluation {
        let iteration = plan.iteration;
        let results: Vec<Option<&CapabilityResult>> = plan
            .capability_names()
            .map(|name| {
                session
                    .capability_results
                    .get(name)
                    .filter(|r| r.iteration == iteration)
            })
            .collect();

        if results.is_empty() {
            return Evaluation::new(Decision::Fail, 0.0, "plan has no capabilities", iteration);
        }

        let total = results.len() as f64;
        let successes: Vec<&CapabilityResult> = results
            .iter()
            .flatten()
            .copied()
            .filter(|r| r.is_success())
            .collect();
        // A capability without a result this iteration counts as an internal failure.
        let failures: Vec<FailureKind> = results
            .iter()
            .filter_map(|r| match r {
                Some(r) if r.is_success() => None,
                Some(r) => Some(r.failure_kind().unwrap_or(FailureKind::Internal)),
                None => Some(FailureKind::Internal),
            })
            .collect();

        let success_fraction = successes.len() as f64 / total;
        let mean_confidence = if successes.is_empty() {
            0.0
        } else {
            successes.iter().map(|r| r.confidence).sum::<f64>() / successes.len() as f64
        };
        let weights = self.success_weight + self.confidence_weight;
        let raw = if weights > 0.0 {
            (self.success_weight * success_fraction + self.confidence_weight * mean_confidence)
                / weights
        } else {
            0.0
        };
        let score = (raw * 10_000.0).round() / 10_000.0;

        let (decision, score, reason) = if failures.iter().any(|k| k.is_fatal()) {
            (Decision::Fail, 0.0, "a capability reported a fatal error".to_string())
        } else if score >= self.quality_threshold {
            (
                Decision::Finish,
                score,
                format!("score {score} meets threshold {}", self.quality_threshold),
            )
        } else if session.iteration_count >= self.max_iterations {
            let budget = StepflowError::IterationBudgetExceeded {
                count: session.iteration_count,
                max: self.max_iterations,
            };
            (
                Decision::Fail,
                score,
                format!("{budget}; score {score} below threshold {}", self.quality_threshold),
            )
        } else if failures.iter().any(|k| k.is_structural()) {
            (
                Decision::NewPlan,
                score,
                "a capability was unavailable or missing input".to_string(),
            )
        } else if !failures.is_empty()
            && failures
                .iter()
                .all(|k| k.is_transient() || *k == FailureKind::Canceled)
        {
            (
                Decision::RetryPlan,
                score,
                format!("{} transient failure(s)", failures.len()),
            )
        } else {
            (
                Decision::NewPlan,
                score,
                format!("score {score} below threshold {}", self.quality_threshold),
            )
        };

        debug!(
            session_id = %session.session_id,
            iteration,
            score,
            decision = %decision,
            "Evaluated iteration"
        );
        Evaluation::new(decision, score, reason, iteration)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use stepflow_core::{CapabilityFailure, CapabilityOutput, Step};
    use stepflow_session::{PartialUpdate, ReducerTable};

    fn plan(iteration: u32, caps: &[&str]) -> Plan {
        Plan::new(
            iteration,
            vec![Step {
                step_id: "step_1".into(),
                capability_names: caps.iter().map(|c| c.to_string()).collect(),
                dependencies: BTreeSet::new(),
                requires_approval: false,
                timeout_ms: 1000,
                retry_budget: 0,
                description: String::new(),
            }],
            caps.iter().map(|c| c.to_string()).collect(),
        )
    }

    fn ok(name: &str, confidence: f64, iteration: u32) -> CapabilityResult {
        CapabilityResult::success(
            name,
            CapabilityOutput::new(serde_json::Value::Null, confidence),
            Utc::now(),
        )
        .in_step("step_1", iteration)
    }

    fn failed(name: &str, kind: FailureKind, iteration: u32) -> CapabilityResult {
        CapabilityResult::failure(name, CapabilityFailure::new(kind, "x"), Utc::now())
            .in_step("step_1", iteration)
    }

    fn session_with(iteration_count: u32, results: Vec<CapabilityResult>) -> Session {
        let table = ReducerTable::default();
        let mut session = Session::new(None, "q");
        session.iteration_count = iteration_count;
        for r in results {
            table.apply(&mut session, PartialUpdate::new().result(r));
        }
        session
    }

    fn evaluator(threshold: f64) -> Evaluator {
        Evaluator::new(threshold, 3, 0.5, 0.5)
    }

    #[test]
    fn test_timeout_plus_confident_success_finishes() {
        let session = session_with(
            1,
            vec![ok("a", 0.9, 1), failed("b", FailureKind::Timeout, 1)],
        );
        let eval = evaluator(0.5).evaluate(&session, &plan(1, &["a", "b"]));
        assert_eq!(eval.decision, Decision::Finish);
        assert_eq!(eval.score, 0.7);
    }

    #[test]
    fn test_transient_failures_retry() {
        let session = session_with(1, vec![failed("a", FailureKind::Timeout, 1)]);
        let eval = evaluator(0.7).evaluate(&session, &plan(1, &["a"]));
        assert_eq!(eval.decision, Decision::RetryPlan);
        assert_eq!(eval.score, 0.0);
    }

    #[test]
    fn test_budget_exhausted_fails() {
        let session = session_with(3, vec![failed("a", FailureKind::Timeout, 3)]);
        let eval = evaluator(0.7).evaluate(&session, &plan(3, &["a"]));
        assert_eq!(eval.decision, Decision::Fail);
        assert!(eval.reason.contains("3/3"));
    }

    #[test]
    fn test_structural_failure_replans() {
        let session = session_with(
            1,
            vec![
                failed("a", FailureKind::Unavailable, 1),
                failed("b", FailureKind::Timeout, 1),
            ],
        );
        let eval = evaluator(0.7).evaluate(&session, &plan(1, &["a", "b"]));
        assert_eq!(eval.decision, Decision::NewPlan);
    }

    #[test]
    fn test_fatal_fails_regardless_of_score() {
        let session = session_with(
            1,
            vec![
                ok("a", 1.0, 1),
                ok("b", 1.0, 1),
                failed("c", FailureKind::Fatal, 1),
            ],
        );
        let eval = evaluator(0.1).evaluate(&session, &plan(1, &["a", "b", "c"]));
        assert_eq!(eval.decision, Decision::Fail);
        assert_eq!(eval.score, 0.0);
    }

    #[test]
    fn test_validation_and_rejection_replan() {
        let session = session_with(1, vec![failed("a", FailureKind::Rejected, 1)]);
        assert_eq!(
            evaluator(0.7).evaluate(&session, &plan(1, &["a"])).decision,
            Decision::NewPlan
        );
    }

    #[test]
    fn test_results_from_other_iterations_are_ignored() {
        let session = session_with(2, vec![ok("a", 1.0, 1)]);
        let eval = evaluator(0.7).evaluate(&session, &plan(2, &["a"]));
        assert_eq!(eval.score, 0.0);
        assert_eq!(eval.decision, Decision::NewPlan);
    }
}
