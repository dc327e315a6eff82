//! Workflow engine for multi-step capability orchestration.
//!
//! Analyzes a request into an intent, builds a dependency-ordered plan over
//! registered capabilities, runs each step's capabilities in parallel, pauses
//! for human approval where policy requires it, evaluates the results and
//! re-plans until the request is satisfied or the iteration budget runs out.
//! Every transition is checkpointed before it becomes visible.
//!
//! # Main types
//!
//! - [`WorkflowEngine`]: Drives sessions and exposes start/resume/recover.
//! - [`PlanBuilder`]: Kahn-level planning over the capability dependency graph.
//! - [`Dispatcher`]: Bounded parallel invocation with timeouts and retries.
//! - [`InterruptController`]: Exactly-once resolution of approval interrupts.
//! - [`Evaluator`]: Scores an iteration and decides what happens next.

/// Engine configuration.
pub mod config;
/// Step execution over the worker pool.
pub mod dispatcher;
/// Session driver and public engine API.
pub mod engine;
/// Iteration scoring and decisions.
pub mod evaluator;
/// Intent analysis.
pub mod intent;
/// Approval interrupts.
pub mod interrupt;
/// Per-capability invocation metrics.
pub mod monitor;
/// Plan construction.
pub mod planner;
/// Capability lookup.
pub mod registry;

pub use config::{EngineConfig, RetryPolicy};
pub use dispatcher::{DispatchSettings, Dispatcher, StepOutcome};
pub use engine::{EngineBuilder, FailureExplanation, RunHandle, RunReport, WorkflowEngine};
pub use evaluator::Evaluator;
pub use intent::{IntentAnalyzer, KeywordIntentAnalyzer, KeywordRule};
pub use interrupt::{InterruptController, InterruptStatus, Resolution, ResolutionOrigin};
pub use monitor::{CapabilityMetrics, CapabilityMonitor};
pub use planner::PlanBuilder;
pub use registry::CapabilityRegistry;
