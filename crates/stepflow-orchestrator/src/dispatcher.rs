//! Runs one plan step: gates it on approval, fans its capabilities out to a
//! bounded worker pool, and folds every result into a [`PartialUpdate`].

use crate::config::RetryPolicy;
use crate::monitor::CapabilityMonitor;
use crate::registry::CapabilityRegistry;
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use stepflow_core::{
    Capability, CapabilityFailure, CapabilityResult, DecisionOption, FailureKind,
    InterruptRequest, SessionContext, Step, TaskDescriptor,
};
use stepflow_session::{AuditRecord, ErrorRecord, PartialUpdate, Session};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What running a step produced.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// The step that ran.
    pub step_id: String,
    /// Capabilities that succeeded.
    pub completed: Vec<String>,
    /// Capabilities that failed, timed out or were canceled.
    pub failed: Vec<String>,
    /// Set when the step is gated and no decision is recorded yet.
    pub interrupted: Option<InterruptRequest>,
    /// One update per capability result.
    pub updates: Vec<PartialUpdate>,
}

impl StepOutcome {
    fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            ..Self::default()
        }
    }

    fn push(&mut self, result: CapabilityResult) {
        let name = result.capability_name.clone();
        let event = if result.is_success() {
            "capability_finished"
        } else {
            "capability_failed"
        };
        let mut audit = AuditRecord::new(name.clone(), event).with_details(
            serde_json::json!({
                "step_id": result.step_id,
                "iteration": result.iteration,
                "status": result.status,
                "attempts": result.attempts,
                "duration_ms": result.duration_ms,
            }),
        );
        audit.timestamp = result.finished_at;

        let mut update = PartialUpdate::new().audit(audit);
        if let Some(error) = &result.error {
            let mut record = ErrorRecord::new(name.clone(), error.to_string()).in_step(&result.step_id);
            record.timestamp = result.finished_at;
            update = update.error(record);
            self.failed.push(name);
        } else {
            self.completed.push(name);
        }
        self.updates.push(update.result(result));
    }
}

/// Settings the dispatcher needs from the engine configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upper bound on concurrently running invocations across all sessions.
    pub max_parallel: usize,
    /// Backoff between retries of a transient failure.
    pub backoff: RetryPolicy,
    /// How long an approval interrupt stays open.
    pub interrupt_timeout_ms: u64,
    /// Applied when an approval interrupt expires.
    pub default_on_timeout: DecisionOption,
}

/// Runs plan steps: approval gates, parallel fan-out, retries and the step deadline.
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    monitor: CapabilityMonitor,
    permits: Arc<Semaphore>,
    settings: DispatchSettings,
}

impl Dispatcher {
    /// A dispatcher whose worker pool holds `settings.max_parallel` permits.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        monitor: CapabilityMonitor,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            monitor,
            permits: Arc::new(Semaphore::new(settings.max_parallel.max(1))),
            settings,
        }
    }

    /// Run `step` of `iteration` against a snapshot of the session.
    pub async fn run_step(
        &self,
        step: &Step,
        session: &Session,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::new(&step.step_id);

        if step.requires_approval {
            match session.step_decision(iteration, &step.step_id) {
                None => {
                    outcome.interrupted = Some(self.interrupt_for(step, session, iteration));
                    return outcome;
                }
                Some(DecisionOption::Reject) => {
                    info!(
                        session_id = %session.session_id,
                        step_id = %step.step_id,
                        "Step rejected by approver"
                    );
                    let now = Utc::now();
                    for name in &step.capability_names {
                        let failure =
                            CapabilityFailure::new(FailureKind::Rejected, "step rejected by approver");
                        outcome.push(
                            CapabilityResult::failure(name.clone(), failure, now)
                                .in_step(&step.step_id, iteration)
                                .with_attempts(0),
                        );
                    }
                    return outcome;
                }
                Some(_) => {}
            }
        }

        let timeout = Duration::from_millis(step.timeout_ms);
        let mut set = JoinSet::new();
        for name in &step.capability_names {
            let Some(capability) = self.registry.get(name).cloned() else {
                warn!(capability = %name, step_id = %step.step_id, "Capability not registered");
                let failure = CapabilityFailure::new(
                    FailureKind::Unavailable,
                    format!("capability '{name}' is not registered"),
                );
                outcome.push(
                    CapabilityResult::failure(name.clone(), failure, Utc::now())
                        .in_step(&step.step_id, iteration)
                        .with_attempts(0),
                );
                continue;
            };

            let task = self.task_for(name, step, session, iteration);
            let invocation = Invocation {
                capability,
                task,
                timeout,
                retry_budget: step.retry_budget,
                backoff: self.settings.backoff.clone(),
                cancel: cancel.clone(),
                permits: Arc::clone(&self.permits),
                monitor: self.monitor.clone(),
            };
            let step_id = step.step_id.clone();
            set.spawn(async move { invocation.run().await.in_step(step_id, iteration) });
        }

        let mut finished: HashMap<String, CapabilityResult> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    finished.insert(result.capability_name.clone(), result);
                }
                Err(e) => warn!(step_id = %step.step_id, error = %e, "Invocation task failed"),
            }
        }

        for name in &step.capability_names {
            if outcome.failed.contains(name) {
                continue;
            }
            let result = finished.remove(name).unwrap_or_else(|| {
                CapabilityResult::failure(
                    name.clone(),
                    CapabilityFailure::new(FailureKind::Internal, "invocation task aborted"),
                    Utc::now(),
                )
                .in_step(&step.step_id, iteration)
            });
            outcome.push(result);
        }

        debug!(
            session_id = %session.session_id,
            step_id = %step.step_id,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            "Step finished"
        );
        outcome
    }

    fn interrupt_for(&self, step: &Step, session: &Session, iteration: u32) -> InterruptRequest {
        InterruptRequest {
            interrupt_id: Uuid::new_v4().to_string(),
            session_id: session.session_id.clone(),
            step_id: step.step_id.clone(),
            iteration,
            reason: format!(
                "step {} requires approval before running: {}",
                step.step_id,
                step.capability_names.join(", ")
            ),
            options: DecisionOption::ALL.to_vec(),
            default_on_timeout: self.settings.default_on_timeout,
            raised_at: Utc::now(),
            timeout_ms: self.settings.interrupt_timeout_ms,
        }
    }

    fn task_for(&self, name: &str, step: &Step, session: &Session, iteration: u32) -> TaskDescriptor {
        let task_payload = session
            .task_overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "query": session.user_query }));

        let mut upstream = BTreeMap::new();
        if let Some(descriptor) = self.registry.descriptor(name) {
            for dep in &descriptor.depends_on {
                if let Some(result) = session.capability_results.get(dep) {
                    if result.is_success() {
                        upstream.insert(dep.clone(), result.payload.clone());
                    }
                }
            }
        }

        TaskDescriptor {
            capability_name: name.to_string(),
            task_payload,
            session_context: SessionContext {
                session_id: session.session_id.clone(),
                user_query: session.user_query.clone(),
                iteration,
                step_id: step.step_id.clone(),
                upstream,
            },
        }
    }
}

/// One capability invocation with its retry loop, owned by a worker task.
struct Invocation {
    capability: Arc<dyn Capability>,
    task: TaskDescriptor,
    timeout: Duration,
    retry_budget: u32,
    backoff: RetryPolicy,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    monitor: CapabilityMonitor,
}

impl Invocation {
    /// Waiting for a permit, every attempt and every backoff share one
    /// deadline of `timeout` from the moment the invocation is scheduled.
    async fn run(self) -> CapabilityResult {
        let name = self.task.capability_name.clone();
        let started = Utc::now();
        let deadline = Instant::now() + self.timeout;

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return canceled(&name, started, 0);
            }
            permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()) => {
                match permit {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        let failure = CapabilityFailure::new(FailureKind::Internal, "worker pool closed");
                        return CapabilityResult::failure(name, failure, started).with_attempts(0);
                    }
                    Err(_) => {
                        warn!(capability = %name, "Deadline passed while waiting for a worker");
                        return CapabilityResult::failure(name, self.deadline_exceeded(), started)
                            .with_attempts(0);
                    }
                }
            }
        };

        self.monitor.start_invocation(&name).await;
        let mut attempt: u32 = 0;
        let result = loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break canceled(&name, started, attempt),
                outcome = tokio::time::timeout_at(deadline, self.attempt()) => outcome,
            };

            let failure = match outcome {
                Ok(Ok(output)) => {
                    break CapabilityResult::success(name.clone(), output, started)
                        .with_attempts(attempt);
                }
                Ok(Err(failure)) => failure,
                Err(_) => self.deadline_exceeded(),
            };

            let delay = self.backoff.backoff(attempt - 1);
            let retry = failure.kind.is_transient()
                && attempt <= self.retry_budget
                && Instant::now() + delay < deadline;
            if retry {
                warn!(
                    capability = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break canceled(&name, started, attempt),
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            break CapabilityResult::failure(name.clone(), failure, started).with_attempts(attempt);
        };
        self.monitor.finish_invocation(&result).await;
        result
    }

    fn deadline_exceeded(&self) -> CapabilityFailure {
        CapabilityFailure::new(
            FailureKind::Timeout,
            format!("exceeded step deadline of {}ms", self.timeout.as_millis()),
        )
    }

    /// One attempt; a panicking worker becomes an `internal` failure.
    async fn attempt(
        &self,
    ) -> Result<stepflow_core::CapabilityOutput, CapabilityFailure> {
        match AssertUnwindSafe(self.capability.invoke(self.task.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "capability panicked".to_string());
                Err(CapabilityFailure::new(FailureKind::Internal, message))
            }
        }
    }
}

fn canceled(name: &str, started: chrono::DateTime<Utc>, attempts: u32) -> CapabilityResult {
    CapabilityResult::failure(
        name,
        CapabilityFailure::new(FailureKind::Canceled, "session canceled"),
        started,
    )
    .with_attempts(attempts)
}
