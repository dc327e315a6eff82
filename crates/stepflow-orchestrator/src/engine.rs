//! The workflow engine: drives each session through
//! `analyzing -> planning -> executing -> evaluating` and owns every
//! checkpoint write.

use crate::config::EngineConfig;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::evaluator::Evaluator;
use crate::intent::{IntentAnalyzer, KeywordIntentAnalyzer};
use crate::interrupt::{InterruptController, Resolution, ResolutionOrigin};
use crate::monitor::CapabilityMonitor;
use crate::planner::PlanBuilder;
use crate::registry::CapabilityRegistry;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepflow_core::{
    Capability, Decision, Evaluation, FailureKind, Intent, InterruptRequest, Message,
    Plan, PlanningError, ResumeCommand, StepflowError, StepflowResult,
};
use stepflow_session::{
    AuditRecord, CheckpointStore, ErrorRecord, MemoryCheckpointStore, PartialUpdate, ReducerTable,
    Session, SessionStateStore, SessionStatus, StepMark, WarningRecord,
};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ENGINE: &str = "engine";

/// Why a session failed, for callers that never see a panic or backtrace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureExplanation {
    /// The `failure_reason` recorded when the session failed.
    pub reason: String,
    /// Every error recorded during the session.
    pub errors: Vec<ErrorRecord>,
    /// The newest audit entries, oldest first.
    pub audit_tail: Vec<AuditRecord>,
}

/// Serializable summary of a session after the driver stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Session the report describes.
    pub session_id: String,
    /// Status when the driver stopped.
    pub status: SessionStatus,
    /// Iterations started so far.
    pub iteration: u32,
    /// Set while the session waits for an approver.
    pub interrupt: Option<InterruptRequest>,
    /// Set once the session completed.
    pub final_response: Option<serde_json::Value>,
    /// The most recent evaluation, if any.
    pub evaluation: Option<Evaluation>,
    /// Set when the session failed.
    pub failure: Option<FailureExplanation>,
}

impl RunReport {
    /// Summarize the current state of `session`.
    pub fn from_session(session: &Session) -> Self {
        let failure = (session.status == SessionStatus::Failed).then(|| FailureExplanation {
            reason: session
                .failure_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            errors: session.errors.clone(),
            audit_tail: session.audit_tail(10).to_vec(),
        });
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            iteration: session.iteration_count,
            interrupt: session.pending_interrupt.clone(),
            final_response: session.final_response.clone(),
            evaluation: session.last_evaluation.clone(),
            failure,
        }
    }
}

/// Result of `start`, `resume` and `recover`.
///
/// `status` keeps reporting after the call returns, e.g. when an approval
/// times out and the session continues in the background.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// The session as of the moment the call returned.
    pub report: RunReport,
    /// Follows later status changes.
    pub status: watch::Receiver<SessionStatus>,
}

impl RunHandle {
    /// Wait until the session reaches `completed` or `failed`.
    pub async fn settled(&mut self) -> SessionStatus {
        if let Ok(status) = self.status.wait_for(|s| s.is_terminal()).await {
            return *status;
        }
        *self.status.borrow()
    }
}

struct DriveState {
    plan: Plan,
    next_seq: u64,
}

/// Per-session driver state. `drive` serializes every transition.
struct SessionRuntime {
    drive: tokio::sync::Mutex<DriveState>,
    plan: RwLock<Plan>,
    cancel: CancellationToken,
    status_tx: watch::Sender<SessionStatus>,
    watchdog: Mutex<Option<AbortHandle>>,
    /// Cleared when a checkpoint write failed: the in-memory session is then
    /// the only record of its last status and must not be evicted.
    durable: AtomicBool,
}

impl SessionRuntime {
    fn new(plan: Plan, next_seq: u64, status: SessionStatus) -> Self {
        let (status_tx, _) = watch::channel(status);
        Self {
            drive: tokio::sync::Mutex::new(DriveState {
                plan: plan.clone(),
                next_seq,
            }),
            plan: RwLock::new(plan),
            cancel: CancellationToken::new(),
            status_tx,
            watchdog: Mutex::new(None),
            durable: AtomicBool::new(true),
        }
    }

    fn set_plan(&self, state: &mut DriveState, plan: Plan) {
        *self.plan.write() = plan.clone();
        state.plan = plan;
    }

    fn disarm(&self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }
}

struct Inner {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    analyzer: Arc<dyn IntentAnalyzer>,
    planner: PlanBuilder,
    dispatcher: Dispatcher,
    evaluator: Evaluator,
    interrupts: InterruptController,
    sessions: SessionStateStore,
    checkpoints: Arc<dyn CheckpointStore>,
    monitor: CapabilityMonitor,
    runtimes: Mutex<HashMap<String, Arc<SessionRuntime>>>,
}

/// Assembles a [`WorkflowEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: CapabilityRegistry,
    analyzer: Option<Arc<dyn IntentAnalyzer>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// A builder with default configuration, no capabilities, the keyword analyzer and in-memory checkpoints.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: CapabilityRegistry::new(),
            analyzer: None,
            checkpoints: None,
        }
    }

    /// Engine configuration; validated by [`Self::build`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the registry with `registry`.
    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register one more capability; a capability with the same name is replaced.
    pub fn capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.registry.register(capability);
        self
    }

    /// The intent analyzer. Defaults to an empty [`KeywordIntentAnalyzer`].
    pub fn analyzer(mut self, analyzer: Arc<dyn IntentAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Where checkpoints go. Defaults to a [`MemoryCheckpointStore`].
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> StepflowResult<WorkflowEngine> {
        self.config.validate()?;
        let config = self.config;
        let registry = Arc::new(self.registry);
        let monitor = CapabilityMonitor::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            monitor.clone(),
            DispatchSettings {
                max_parallel: config.max_parallel,
                backoff: config.invocation_retry.clone(),
                interrupt_timeout_ms: config.interrupt_timeout_ms,
                default_on_timeout: config.default_on_timeout,
            },
        );
        let inner = Inner {
            planner: PlanBuilder::new(
                config.approval_mode,
                config.max_step_timeout_ms,
                config.invocation_retry.max_retries,
            ),
            evaluator: Evaluator::new(
                config.quality_threshold,
                config.max_iterations,
                config.success_weight,
                config.confidence_weight,
            ),
            sessions: SessionStateStore::new(ReducerTable::with_caps(config.log_caps.clone())),
            analyzer: self
                .analyzer
                .unwrap_or_else(|| Arc::new(KeywordIntentAnalyzer::default())),
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            interrupts: InterruptController::new(),
            runtimes: Mutex::new(HashMap::new()),
            dispatcher,
            registry,
            monitor,
            config,
        };
        info!(
            capabilities = inner.registry.len(),
            max_iterations = inner.config.max_iterations,
            approval_mode = ?inner.config.approval_mode,
            "Workflow engine ready"
        );
        Ok(WorkflowEngine {
            inner: Arc::new(inner),
        })
    }
}

/// Drives sessions through analysis, planning, execution and evaluation.
///
/// Cheap to clone; clones share all sessions.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

impl WorkflowEngine {
    /// Start assembling an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The validated configuration the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Registered capabilities.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    /// Per-capability invocation metrics.
    pub fn monitor(&self) -> &CapabilityMonitor {
        &self.inner.monitor
    }

    /// The checkpoint store every commit goes through.
    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.inner.checkpoints)
    }

    /// Start a session and drive it until it completes, fails or waits for
    /// approval.
    pub async fn start(
        &self,
        session_id: Option<String>,
        user_query: impl Into<String>,
    ) -> StepflowResult<RunHandle> {
        let session = Session::new(session_id, user_query);
        let session_id = session.session_id.clone();
        if self.inner.checkpoints.latest_seq(&session_id).await?.is_some() {
            return Err(StepflowError::Session(format!(
                "session {session_id} already has checkpoints; use recover"
            )));
        }
        let query = session.user_query.clone();
        self.inner.sessions.insert(session).await?;

        let runtime = Arc::new(SessionRuntime::new(Plan::empty(), 1, SessionStatus::Analyzing));
        let mut state = runtime.drive.lock().await;
        self.inner
            .runtimes
            .lock()
            .insert(session_id.clone(), Arc::clone(&runtime));
        info!(session_id = %session_id, "Session started");

        let initial = PartialUpdate::new()
            .message(Message::user(query))
            .audit(AuditRecord::new(ENGINE, "session_started"))
            .next_iteration()
            .status(SessionStatus::Analyzing);
        if settled(
            self.commit(&runtime, &mut state, &session_id, vec![initial])
                .await
                .map(drop),
        )?
        .is_some()
        {
            self.drive(&runtime, &mut state, &session_id).await?;
        }
        drop(state);
        self.finish(&runtime, &session_id).await
    }

    /// Resolve the pending interrupt of a session and continue driving it.
    pub async fn resume(&self, session_id: &str, command: ResumeCommand) -> StepflowResult<RunHandle> {
        let runtime = self.runtime_or_recover(session_id).await?;
        let mut state = runtime.drive.lock().await;

        let session = self.session(session_id).await?;
        if let Err(e) = awaiting(&session, &command.interrupt_id) {
            drop(state);
            if session.status.is_terminal() {
                self.finish(&runtime, session_id).await?;
            }
            return Err(e);
        }

        let resolution = self
            .inner
            .interrupts
            .resolve(command, ResolutionOrigin::Manual)?;
        runtime.disarm();
        if settled(
            self.apply_resolution(&runtime, &mut state, session_id, resolution)
                .await,
        )?
        .is_some()
        {
            self.drive(&runtime, &mut state, session_id).await?;
        }
        drop(state);
        self.finish(&runtime, session_id).await
    }

    /// Cancel a session. In-flight invocations observe the cancellation and
    /// the session ends `failed` with reason `canceled`.
    pub async fn cancel(&self, session_id: &str) -> StepflowResult<RunReport> {
        let runtime = self.runtime_or_recover(session_id).await?;
        runtime.cancel.cancel();
        let mut state = runtime.drive.lock().await;
        runtime.disarm();

        let session = self.session(session_id).await?;
        if !session.status.is_terminal() {
            settled(
                self.fail(&runtime, &mut state, session_id, StepflowError::Canceled.to_string())
                    .await,
            )?;
        }
        drop(state);
        Ok(self.finish(&runtime, session_id).await?.report)
    }

    /// Report of a live session, or of its latest checkpoint.
    pub async fn get_status(&self, session_id: &str) -> StepflowResult<RunReport> {
        Ok(RunReport::from_session(&self.session(session_id).await?))
    }

    /// The live session, or the latest checkpointed one.
    pub async fn session(&self, session_id: &str) -> StepflowResult<Session> {
        match self.inner.sessions.get(session_id).await {
            Ok(session) => Ok(session),
            Err(StepflowError::SessionNotFound(_)) => Ok(self
                .inner
                .checkpoints
                .load(session_id, None)
                .await?
                .0),
            Err(e) => Err(e),
        }
    }

    /// The current plan, or the latest checkpointed one.
    pub async fn plan(&self, session_id: &str) -> StepflowResult<Plan> {
        if let Some(runtime) = self.runtime(session_id) {
            return Ok(runtime.plan.read().clone());
        }
        Ok(self.inner.checkpoints.load(session_id, None).await?.1)
    }

    /// Watch the status of a session. A session that is no longer live
    /// yields a receiver holding its checkpointed status.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> StepflowResult<watch::Receiver<SessionStatus>> {
        if let Some(runtime) = self.runtime(session_id) {
            return Ok(runtime.status_tx.subscribe());
        }
        let (session, _) = self.inner.checkpoints.load(session_id, None).await?;
        Ok(watch::channel(session.status).1)
    }

    /// Ids of sessions currently held in memory, sorted.
    ///
    /// Sessions leave this set once they complete or fail; their state stays
    /// readable through the checkpoint store.
    pub fn live_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.runtimes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reload a session from its latest checkpoint and continue it.
    ///
    /// Steps marked completed in the checkpoint are never run again. A
    /// pending interrupt is re-armed with its remaining timeout.
    pub async fn recover(&self, session_id: &str) -> StepflowResult<RunHandle> {
        let runtime = self.runtime_or_recover(session_id).await?;
        drop(runtime.drive.lock().await);
        self.finish(&runtime, session_id).await
    }

    /// Recover every session in the checkpoint store.
    pub async fn recover_all(&self) -> StepflowResult<Vec<RunReport>> {
        let mut reports = Vec::new();
        for session_id in self.inner.checkpoints.sessions().await? {
            match self.recover(&session_id).await {
                Ok(handle) => reports.push(handle.report),
                Err(e) => warn!(session_id = %session_id, error = %e, "Recovery failed"),
            }
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Runtime bookkeeping
    // -----------------------------------------------------------------------

    fn runtime(&self, session_id: &str) -> Option<Arc<SessionRuntime>> {
        self.inner.runtimes.lock().get(session_id).cloned()
    }

    /// Build the caller's handle and release a session that settled.
    async fn finish(&self, runtime: &Arc<SessionRuntime>, session_id: &str) -> StepflowResult<RunHandle> {
        let session = self.session(session_id).await?;
        let handle = RunHandle {
            report: RunReport::from_session(&session),
            status: runtime.status_tx.subscribe(),
        };
        if session.status.is_terminal() {
            runtime.disarm();
            self.evict(runtime, session_id).await;
        }
        Ok(handle)
    }

    /// Drop every in-memory trace of a terminal session. Its checkpoints
    /// stay, so reads and duplicate resumes are answered from the store.
    async fn evict(&self, runtime: &Arc<SessionRuntime>, session_id: &str) {
        if !runtime.durable.load(Ordering::Acquire) {
            debug!(session_id, "Keeping session without a terminal checkpoint in memory");
            return;
        }
        self.inner.sessions.remove(session_id).await;
        let interrupts = self.inner.interrupts.forget_session(session_id);
        self.inner.checkpoints.release(session_id);
        {
            let mut runtimes = self.inner.runtimes.lock();
            if runtimes
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, runtime))
            {
                runtimes.remove(session_id);
            }
        }
        debug!(session_id, interrupts, "Evicted settled session");
    }

    async fn runtime_or_recover(&self, session_id: &str) -> StepflowResult<Arc<SessionRuntime>> {
        if let Some(runtime) = self.runtime(session_id) {
            return Ok(runtime);
        }

        let (session, plan) = self.inner.checkpoints.load(session_id, None).await?;
        let latest = self
            .inner
            .checkpoints
            .latest_seq(session_id)
            .await?
            .unwrap_or(0);
        let runtime = Arc::new(SessionRuntime::new(plan, latest + 1, session.status));
        let mut state = runtime.drive.lock().await;
        {
            let mut runtimes = self.inner.runtimes.lock();
            if let Some(existing) = runtimes.get(session_id) {
                return Ok(Arc::clone(existing));
            }
            runtimes.insert(session_id.to_string(), Arc::clone(&runtime));
        }

        info!(
            session_id,
            seq = latest,
            status = %session.status,
            iteration = session.iteration_count,
            "Recovering session from checkpoint"
        );
        let status = session.status;
        let pending = session.pending_interrupt.clone();
        self.inner.sessions.restore(session).await;

        match status {
            SessionStatus::Interrupted => {
                if let Some(request) = pending {
                    self.inner.interrupts.restore(request.clone());
                    self.arm_watchdog(&runtime, session_id, &request);
                }
            }
            SessionStatus::Completed | SessionStatus::Failed => {}
            _ => self.drive(&runtime, &mut state, session_id).await?,
        }
        drop(state);
        Ok(runtime)
    }

    // -----------------------------------------------------------------------
    // Commit path
    // -----------------------------------------------------------------------

    /// Merge `updates`, checkpoint the result, then make it visible.
    async fn commit(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session_id: &str,
        updates: Vec<PartialUpdate>,
    ) -> StepflowResult<Session> {
        let preview = self.inner.sessions.preview(session_id, updates).await?;
        let seq = state.next_seq;

        if let Err(e) = self.save_with_retry(preview.session(), &state.plan, seq).await {
            error!(session_id, seq, error = %e, "Checkpoint write failed, failing session");
            runtime.durable.store(false, Ordering::Release);
            let failed = self
                .inner
                .sessions
                .apply(
                    session_id,
                    PartialUpdate::new()
                        .error(ErrorRecord::new("checkpoint_store", e.to_string()))
                        .audit(AuditRecord::new(ENGINE, "session_failed"))
                        .status(SessionStatus::Failed)
                        .failure(e.to_string()),
                )
                .await?;
            runtime.status_tx.send_replace(failed.status);
            return Err(e);
        }

        state.next_seq += 1;
        let session = self.inner.sessions.commit(preview).await?;
        runtime.status_tx.send_replace(session.status);
        debug!(session_id, seq, status = %session.status, "Committed checkpoint");

        if let Some(keep) = self.inner.config.checkpoint_keep_latest {
            if let Err(e) = self.inner.checkpoints.prune(session_id, keep).await {
                warn!(session_id, error = %e, "Checkpoint pruning failed");
            }
        }
        Ok(session)
    }

    async fn save_with_retry(&self, session: &Session, plan: &Plan, seq: u64) -> StepflowResult<()> {
        let policy = &self.inner.config.checkpoint_retry;
        let mut attempt = 0;
        loop {
            match self.inner.checkpoints.save(session, plan, seq).await {
                Ok(_) => return Ok(()),
                Err(e @ StepflowError::CheckpointConflict { .. }) => {
                    return Err(StepflowError::CheckpointWrite(e.to_string()))
                }
                Err(e) if attempt < policy.max_retries => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        session_id = %session.session_id,
                        seq,
                        attempt = attempt + 1,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StepflowError::CheckpointWrite(format!(
                        "seq {seq} after {} attempt(s): {e}",
                        attempt + 1
                    )))
                }
            }
        }
    }

    async fn fail(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session_id: &str,
        reason: String,
    ) -> StepflowResult<()> {
        warn!(session_id, reason = %reason, "Session failed");
        let update = PartialUpdate::new()
            .error(ErrorRecord::new(ENGINE, reason.clone()))
            .audit(
                AuditRecord::new(ENGINE, "session_failed")
                    .with_details(serde_json::json!({ "reason": reason })),
            )
            .interrupt(None)
            .status(SessionStatus::Failed)
            .failure(reason);
        self.commit(runtime, state, session_id, vec![update])
            .await
            .map(drop)
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        runtime: &Arc<SessionRuntime>,
        state: &mut DriveState,
        session_id: &str,
    ) -> StepflowResult<()> {
        loop {
            let session = self.inner.sessions.get(session_id).await?;
            if session.status.is_terminal() || session.status == SessionStatus::Interrupted {
                return Ok(());
            }
            if runtime.cancel.is_cancelled() {
                settled(
                    self.fail(runtime, state, session_id, StepflowError::Canceled.to_string())
                        .await,
                )?;
                return Ok(());
            }

            let phase = match session.status {
                SessionStatus::Analyzing => self.analyze(runtime, state, &session).await,
                SessionStatus::Planning => self.plan_phase(runtime, state, &session).await,
                SessionStatus::Executing => self.execute(runtime, state, session_id).await,
                SessionStatus::Evaluating => self.evaluate(runtime, state, &session).await,
                _ => return Ok(()),
            };

            match settled(phase) {
                Ok(Some(())) => {}
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!(session_id, error = %e, "Driver error");
                    settled(self.fail(runtime, state, session_id, e.to_string()).await)?;
                    return Ok(());
                }
            }
        }
    }

    /// Record an error and retry through `retry_status`, or fail the session
    /// when the iteration budget is spent.
    async fn retry_or_fail(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session: &Session,
        error: ErrorRecord,
        retry_status: SessionStatus,
        retry: PartialUpdate,
    ) -> StepflowResult<()> {
        let max = self.inner.config.max_iterations;
        if session.iteration_count >= max {
            let budget = StepflowError::IterationBudgetExceeded {
                count: session.iteration_count,
                max,
            };
            let reason = format!("{budget}: {}", error.message);
            let update = PartialUpdate::new().error(error);
            self.commit(runtime, state, &session.session_id, vec![update])
                .await?;
            return self.fail(runtime, state, &session.session_id, reason).await;
        }

        info!(
            session_id = %session.session_id,
            iteration = session.iteration_count + 1,
            next = %retry_status,
            "Retrying after error"
        );
        let update = retry
            .audit(
                AuditRecord::new(ENGINE, "iteration_retry")
                    .with_details(serde_json::json!({ "error": error.message })),
            )
            .error(error)
            .next_iteration()
            .status(retry_status);
        self.commit(runtime, state, &session.session_id, vec![update])
            .await?;
        Ok(())
    }

    async fn analyze(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session: &Session,
    ) -> StepflowResult<()> {
        let intent = match self.inner.analyzer.analyze(&session.user_query).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "Intent analysis failed");
                let error = ErrorRecord::new("intent_analyzer", e.to_string());
                return self
                    .retry_or_fail(
                        runtime,
                        state,
                        session,
                        error,
                        SessionStatus::Analyzing,
                        PartialUpdate::new(),
                    )
                    .await;
            }
        };

        debug!(
            session_id = %session.session_id,
            capabilities = ?intent.capabilities,
            complexity = intent.complexity,
            "Intent analyzed"
        );
        let mut update = PartialUpdate::new().audit(
            AuditRecord::new(ENGINE, "intent_analyzed").with_details(serde_json::json!({
                "capabilities": intent.capabilities,
                "complexity": intent.complexity,
                "ambiguities": intent.ambiguities,
            })),
        );
        for term in &intent.ambiguities {
            update = update.warning(WarningRecord::new(
                "intent_analyzer",
                format!("ambiguous term in query: '{term}'"),
            ));
        }
        if intent.clarification_needed {
            update = update.message(Message::system(
                "The request contains ambiguous terms; results may need clarification.",
            ));
        }
        let update = update.intent(intent).status(SessionStatus::Planning);
        self.commit(runtime, state, &session.session_id, vec![update])
            .await?;
        Ok(())
    }

    async fn plan_phase(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session: &Session,
    ) -> StepflowResult<()> {
        let Some(intent) = session.intent.clone() else {
            let update = PartialUpdate::new().status(SessionStatus::Analyzing);
            self.commit(runtime, state, &session.session_id, vec![update])
                .await?;
            return Ok(());
        };

        match self
            .inner
            .planner
            .build(&intent, &self.inner.registry, session.iteration_count)
        {
            Ok(plan) => {
                info!(
                    session_id = %session.session_id,
                    plan_id = %plan.plan_id,
                    steps = plan.steps.len(),
                    iteration = plan.iteration,
                    "Plan built"
                );
                let audit = AuditRecord::new(ENGINE, "plan_built").with_details(serde_json::json!({
                    "plan_id": plan.plan_id,
                    "iteration": plan.iteration,
                    "steps": plan.steps.iter().map(|s| &s.capability_names).collect::<Vec<_>>(),
                }));
                runtime.set_plan(state, plan);
                let update = PartialUpdate::new()
                    .audit(audit)
                    .status(SessionStatus::Executing);
                self.commit(runtime, state, &session.session_id, vec![update])
                    .await?;
                Ok(())
            }
            Err(planning) => {
                warn!(session_id = %session.session_id, error = %planning, "Planning failed");
                let error = ErrorRecord::new("planner", StepflowError::from(planning.clone()).to_string());
                let excluded: BTreeSet<String> = match &planning {
                    PlanningError::UnknownCapability(name) => BTreeSet::from([name.clone()]),
                    PlanningError::Cycle(nodes) => nodes.iter().cloned().collect(),
                    PlanningError::EmptyIntent => BTreeSet::new(),
                };
                if excluded.is_empty() {
                    self.retry_or_fail(
                        runtime,
                        state,
                        session,
                        error,
                        SessionStatus::Analyzing,
                        PartialUpdate::new(),
                    )
                    .await
                } else {
                    self.retry_or_fail(
                        runtime,
                        state,
                        session,
                        error,
                        SessionStatus::Planning,
                        PartialUpdate::new().intent(intent.without(&excluded)),
                    )
                    .await
                }
            }
        }
    }

    async fn execute(
        &self,
        runtime: &Arc<SessionRuntime>,
        state: &mut DriveState,
        session_id: &str,
    ) -> StepflowResult<()> {
        let plan = state.plan.clone();
        let iteration = plan.iteration;

        for step in &plan.steps {
            let session = self.inner.sessions.get(session_id).await?;
            if session.is_step_completed(iteration, &step.step_id) {
                debug!(session_id, step_id = %step.step_id, "Step already completed, skipping");
                continue;
            }
            if runtime.cancel.is_cancelled() {
                return Ok(());
            }

            debug!(
                session_id,
                step_id = %step.step_id,
                capabilities = ?step.capability_names,
                "Running step"
            );
            let outcome = self
                .inner
                .dispatcher
                .run_step(step, &session, iteration, &runtime.cancel)
                .await;

            if let Some(request) = outcome.interrupted {
                self.inner.interrupts.raise(request.clone());
                let update = PartialUpdate::new()
                    .audit(
                        AuditRecord::new(ENGINE, "interrupt_raised").with_details(serde_json::json!({
                            "interrupt_id": request.interrupt_id,
                            "step_id": request.step_id,
                            "timeout_ms": request.timeout_ms,
                        })),
                    )
                    .interrupt(Some(request.clone()))
                    .status(SessionStatus::Interrupted);
                self.commit(runtime, state, session_id, vec![update]).await?;
                self.arm_watchdog(runtime, session_id, &request);
                return Ok(());
            }

            let mut updates = outcome.updates;
            updates.push(
                PartialUpdate::new()
                    .completed(StepMark::new(iteration, &step.step_id))
                    .audit(
                        AuditRecord::new(ENGINE, "step_completed").with_details(serde_json::json!({
                            "step_id": step.step_id,
                            "iteration": iteration,
                            "completed": outcome.completed,
                            "failed": outcome.failed,
                        })),
                    ),
            );
            self.commit(runtime, state, session_id, updates).await?;
        }

        let update = PartialUpdate::new().status(SessionStatus::Evaluating);
        self.commit(runtime, state, session_id, vec![update]).await?;
        Ok(())
    }

    async fn evaluate(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session: &Session,
    ) -> StepflowResult<()> {
        let evaluation = self.inner.evaluator.evaluate(session, &state.plan);
        info!(
            session_id = %session.session_id,
            iteration = evaluation.iteration,
            score = evaluation.score,
            decision = %evaluation.decision,
            "Iteration evaluated"
        );
        let base = PartialUpdate::new()
            .audit(
                AuditRecord::new(ENGINE, "evaluated").with_details(serde_json::json!({
                    "decision": evaluation.decision,
                    "score": evaluation.score,
                    "reason": evaluation.reason,
                })),
            )
            .evaluation(evaluation.clone());

        let id = &session.session_id;
        match evaluation.decision {
            Decision::Finish => {
                let response = final_response(session, &state.plan, &evaluation);
                let update = base
                    .message(Message::assistant(format!(
                        "Completed with score {} after {} iteration(s).",
                        evaluation.score, session.iteration_count
                    )))
                    .final_response(response)
                    .status(SessionStatus::Completed);
                self.commit(runtime, state, id, vec![update]).await?;
                info!(session_id = %id, "Session completed");
            }
            Decision::Fail => {
                self.commit(runtime, state, id, vec![base]).await?;
                self.fail(runtime, state, id, evaluation.reason).await?;
            }
            Decision::RetryPlan => {
                let plan = state.plan.reissue(session.iteration_count + 1);
                runtime.set_plan(state, plan);
                let update = base.next_iteration().status(SessionStatus::Executing);
                self.commit(runtime, state, id, vec![update]).await?;
            }
            Decision::NewPlan => {
                let mut update = base.next_iteration().status(SessionStatus::Planning);
                if let Some(intent) = &session.intent {
                    let (intent, substituted) = self.replan_intent(session, &state.plan, intent);
                    for (failed, alternative) in substituted {
                        info!(session_id = %id, failed = %failed, alternative = %alternative, "Substituting capability");
                        update = update.audit(
                            AuditRecord::new(ENGINE, "capability_substituted").with_details(
                                serde_json::json!({ "failed": failed, "alternative": alternative }),
                            ),
                        );
                    }
                    update = update.intent(intent);
                }
                self.commit(runtime, state, id, vec![update]).await?;
            }
        }
        Ok(())
    }

    /// The intent for the next plan: unavailable capabilities are dropped and
    /// other failed ones are replaced by their first registered alternative
    /// that was neither requested nor failed. Returns the substitutions made.
    fn replan_intent(
        &self,
        session: &Session,
        plan: &Plan,
        intent: &Intent,
    ) -> (Intent, Vec<(String, String)>) {
        let failed: Vec<(&str, FailureKind)> = session
            .results_in(plan.iteration)
            .filter_map(|r| r.failure_kind().map(|kind| (r.capability_name.as_str(), kind)))
            .collect();
        let unavailable: BTreeSet<String> = failed
            .iter()
            .filter(|(_, kind)| *kind == FailureKind::Unavailable)
            .map(|(name, _)| name.to_string())
            .collect();

        let mut next = intent.clone();
        let mut substituted = Vec::new();
        for (name, kind) in &failed {
            if matches!(kind, FailureKind::Rejected | FailureKind::Canceled) {
                continue;
            }
            let Some(descriptor) = self.inner.registry.descriptor(name) else {
                continue;
            };
            let alternative = descriptor.alternatives.iter().find(|alt| {
                self.inner.registry.contains(alt)
                    && !next.capabilities.contains(alt)
                    && !failed.iter().any(|(f, _)| f == alt)
            });
            if let Some(alternative) = alternative {
                next = next.substitute(name, alternative);
                substituted.push((name.to_string(), alternative.clone()));
            }
        }
        (next.without(&unavailable), substituted)
    }

    // -----------------------------------------------------------------------
    // Interrupts
    // -----------------------------------------------------------------------

    async fn apply_resolution(
        &self,
        runtime: &SessionRuntime,
        state: &mut DriveState,
        session_id: &str,
        resolution: Resolution,
    ) -> StepflowResult<()> {
        let request = &resolution.request;
        let (event, reviewer) = match resolution.origin {
            ResolutionOrigin::Manual => (
                "interrupt_resolved",
                resolution
                    .reviewer
                    .clone()
                    .unwrap_or_else(|| "approver".to_string()),
            ),
            ResolutionOrigin::Timeout => ("interrupt_auto_resolved", "timeout".to_string()),
        };

        let mut audit = AuditRecord::new(ENGINE, event).with_details(serde_json::json!({
            "interrupt_id": request.interrupt_id,
            "step_id": request.step_id,
            "decision": resolution.decision,
            "reviewer": reviewer,
        }));
        audit.timestamp = resolution.resolved_at;

        let mut updates = vec![PartialUpdate::new()
            .decision(
                StepMark::new(request.iteration, &request.step_id),
                resolution.decision,
            )
            .resolved(&request.interrupt_id)
            .interrupt(None)
            .message(Message::approver(
                format!("{} {}", resolution.decision, request.step_id),
                reviewer,
            ))
            .audit(audit)
            .status(SessionStatus::Executing)];
        if let Some(patch) = resolution.state_patch.clone() {
            if !patch.is_empty() {
                updates.push(patch.into());
            }
        }
        self.commit(runtime, state, session_id, updates).await?;
        Ok(())
    }

    /// Apply the interrupt's default decision once it expires.
    fn arm_watchdog(&self, runtime: &Arc<SessionRuntime>, session_id: &str, request: &InterruptRequest) {
        let delay = (request.expires_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let engine = self.clone();
        let task_runtime = Arc::clone(runtime);
        let session_id = session_id.to_string();
        let interrupt_id = request.interrupt_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine
                .on_interrupt_timeout(&task_runtime, &session_id, &interrupt_id)
                .await;
        });
        *runtime.watchdog.lock() = Some(handle.abort_handle());
    }

    async fn on_interrupt_timeout(
        &self,
        runtime: &Arc<SessionRuntime>,
        session_id: &str,
        interrupt_id: &str,
    ) {
        let mut state = runtime.drive.lock().await;
        if runtime.cancel.is_cancelled() {
            return;
        }
        let resolution = match self.inner.interrupts.resolve_on_timeout(interrupt_id) {
            Ok(resolution) => resolution,
            Err(e) => {
                debug!(session_id, interrupt_id, error = %e, "Watchdog found interrupt resolved");
                return;
            }
        };
        warn!(
            session_id,
            interrupt_id,
            decision = %resolution.decision,
            "Approval timed out, applying default decision"
        );
        match settled(
            self.apply_resolution(runtime, &mut state, session_id, resolution)
                .await,
        ) {
            Ok(Some(())) => {}
            Ok(None) => return,
            Err(e) => {
                error!(session_id, error = %e, "Failed to apply timeout resolution");
                return;
            }
        }
        if let Err(e) = self.drive(runtime, &mut state, session_id).await {
            error!(session_id, error = %e, "Driver error after timeout resolution");
        }
        match self.inner.sessions.get(session_id).await {
            Ok(session) if session.status.is_terminal() => {
                // This task is the armed watchdog; release it without aborting itself.
                runtime.watchdog.lock().take();
                self.evict(runtime, session_id).await;
            }
            _ => {}
        }
    }
}

/// Whether `session` is waiting on `interrupt_id`.
fn awaiting(session: &Session, interrupt_id: &str) -> StepflowResult<()> {
    if session.resolved_interrupts.contains(interrupt_id) {
        return Err(StepflowError::AlreadyResolved(interrupt_id.to_string()));
    }
    match &session.pending_interrupt {
        Some(pending) if pending.interrupt_id == interrupt_id => Ok(()),
        _ => Err(StepflowError::UnknownInterrupt(interrupt_id.to_string())),
    }
}

/// `Ok(None)` when a checkpoint write failed: the session is already
/// marked failed and the driver must stop.
fn settled<T>(result: StepflowResult<T>) -> StepflowResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StepflowError::CheckpointWrite(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Successful payloads in plan order.
fn final_response(session: &Session, plan: &Plan, evaluation: &Evaluation) -> serde_json::Value {
    let results: Vec<serde_json::Value> = plan
        .capability_names()
        .filter_map(|name| session.capability_results.get(name))
        .filter(|r| r.is_success() && r.iteration == plan.iteration)
        .map(|r| {
            serde_json::json!({
                "capability": r.capability_name,
                "step_id": r.step_id,
                "confidence": r.confidence,
                "payload": r.payload,
            })
        })
        .collect();
    serde_json::json!({
        "query": session.user_query,
        "score": evaluation.score,
        "results": results,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stepflow_core::{
        CapabilityDescriptor, CapabilityFailure, CapabilityOutput, DecisionOption, Intent,
        TaskDescriptor,
    };
    use stepflow_session::FileCheckpointStore;

    struct Fixed {
        descriptor: CapabilityDescriptor,
        confidence: f64,
    }

    #[async_trait]
    impl Capability for Fixed {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, task: TaskDescriptor) -> Result<CapabilityOutput, CapabilityFailure> {
            Ok(CapabilityOutput::new(
                serde_json::json!({ "seen": task.task_payload }),
                self.confidence,
            ))
        }
    }

    struct Failing;

    #[async_trait]
    impl IntentAnalyzer for Failing {
        async fn analyze(&self, _query: &str) -> StepflowResult<Intent> {
            Err(StepflowError::Capability("analyzer offline".into()))
        }
    }

    fn engine(confidence: f64) -> WorkflowEngine {
        WorkflowEngine::builder()
            .capability(Arc::new(Fixed {
                descriptor: CapabilityDescriptor::new("search"),
                confidence,
            }))
            .analyzer(Arc::new(
                KeywordIntentAnalyzer::default().rule("search", ["find", "search"]),
            ))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_capability_completes() {
        let engine = engine(0.9);
        let handle = engine.start(Some("s-1".into()), "find the report").await.unwrap();
        assert_eq!(handle.report.status, SessionStatus::Completed);
        assert_eq!(handle.report.iteration, 1);

        let response = handle.report.final_response.unwrap();
        assert_eq!(response["results"][0]["capability"], "search");
        assert_eq!(
            response["results"][0]["payload"]["seen"]["query"],
            "find the report"
        );

        let session = engine.session("s-1").await.unwrap();
        assert!(session
            .audit_trail
            .iter()
            .any(|a| a.event == "plan_built"));
        assert_eq!(session.call_counts["search"], 1);
    }

    #[tokio::test]
    async fn test_duplicate_session_id_is_rejected() {
        let engine = engine(0.9);
        engine.start(Some("dup".into()), "find it").await.unwrap();
        assert!(engine.start(Some("dup".into()), "find it").await.is_err());
    }

    #[tokio::test]
    async fn test_low_confidence_exhausts_budget() {
        let engine = engine(0.1);
        let handle = engine.start(None, "find things").await.unwrap();
        assert_eq!(handle.report.status, SessionStatus::Failed);
        assert_eq!(handle.report.iteration, 3);
        let failure = handle.report.failure.unwrap();
        assert!(failure.reason.contains("3/3"), "{}", failure.reason);
    }

    #[tokio::test]
    async fn test_analyzer_errors_are_retried_then_fail() {
        let engine = WorkflowEngine::builder()
            .analyzer(Arc::new(Failing))
            .build()
            .unwrap();
        let handle = engine.start(None, "anything").await.unwrap();
        assert_eq!(handle.report.status, SessionStatus::Failed);
        assert_eq!(handle.report.iteration, 3);
        let failure = handle.report.failure.unwrap();
        assert!(failure.reason.contains("Iteration budget exceeded"));
        assert_eq!(
            failure
                .errors
                .iter()
                .filter(|e| e.origin == "intent_analyzer")
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_unknown_capability_is_excluded_before_replanning() {
        let engine = WorkflowEngine::builder()
            .capability(Arc::new(Fixed {
                descriptor: CapabilityDescriptor::new("search"),
                confidence: 0.9,
            }))
            .analyzer(Arc::new(
                KeywordIntentAnalyzer::default()
                    .rule("translate", ["translate"])
                    .rule("search", ["find"]),
            ))
            .build()
            .unwrap();
        let handle = engine
            .start(Some("s-x".into()), "find and translate")
            .await
            .unwrap();
        assert_eq!(handle.report.status, SessionStatus::Completed);
        assert_eq!(handle.report.iteration, 2);
        let plan = engine.plan("s-x").await.unwrap();
        assert_eq!(plan.requested, vec!["search"]);
    }

    #[tokio::test]
    async fn test_status_subscription_and_unknown_session() {
        let engine = engine(0.9);
        engine.start(Some("s-w".into()), "search").await.unwrap();
        let rx = engine.subscribe("s-w").await.unwrap();
        assert_eq!(*rx.borrow(), SessionStatus::Completed);
        assert!(matches!(
            engine.get_status("missing").await,
            Err(StepflowError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settled_sessions_are_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileCheckpointStore::new(tmp.path().to_path_buf())
                .await
                .unwrap(),
        );
        let engine = WorkflowEngine::builder()
            .capability(Arc::new(Fixed {
                descriptor: CapabilityDescriptor::new("search").critical(true),
                confidence: 0.9,
            }))
            .analyzer(Arc::new(KeywordIntentAnalyzer::default().rule("search", ["find"])))
            .checkpoints(store.clone())
            .build()
            .unwrap();

        let handle = engine.start(Some("s-ev".into()), "find it").await.unwrap();
        assert_eq!(handle.report.status, SessionStatus::Interrupted);
        assert_eq!(engine.live_sessions(), vec!["s-ev"]);
        assert_eq!(engine.inner.interrupts.len(), 1);
        let interrupt_id = handle.report.interrupt.unwrap().interrupt_id;

        let done = engine
            .resume("s-ev", ResumeCommand::new(&interrupt_id, DecisionOption::Approve))
            .await
            .unwrap();
        assert_eq!(done.report.status, SessionStatus::Completed);

        assert!(engine.live_sessions().is_empty());
        assert!(engine.inner.sessions.ids().await.is_empty());
        assert!(engine.inner.interrupts.is_empty());
        assert_eq!(store.locked_sessions(), 0);

        // Reads and late resumes are answered from the checkpoint.
        let report = engine.get_status("s-ev").await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        let err = engine
            .resume("s-ev", ResumeCommand::new(&interrupt_id, DecisionOption::Approve))
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::AlreadyResolved(_)));
        assert!(engine.live_sessions().is_empty());
        assert!(engine.inner.sessions.ids().await.is_empty());
    }
}
