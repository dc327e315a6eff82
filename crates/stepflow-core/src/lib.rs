//! Core types and error definitions for the stepflow engine.
//!
//! This crate provides the foundational types shared across all stepflow
//! crates: the error taxonomy, the capability invocation contract, the
//! approval (interrupt/resume) protocol and the workflow value types.
//!
//! # Main types
//!
//! - [`StepflowError`]: Unified error enum for all stepflow subsystems.
//! - [`StepflowResult`]: Convenience alias for `Result<T, StepflowError>`.
//! - [`Capability`]: The async trait every worker implements.
//! - [`CapabilityResult`]: Immutable record of one invocation.
//! - [`InterruptRequest`] / [`ResumeCommand`]: The human approval protocol.
//! - [`Intent`], [`Plan`], [`Step`], [`Evaluation`]: One iteration's values.

/// Approval types for human-in-the-loop workflows.
pub mod approval;
/// The capability invocation contract.
pub mod capability;
/// Error taxonomy.
pub mod error;
/// Conversation log entries.
pub mod message;
/// Intent, plan and evaluation types.
pub mod workflow;

pub use approval::{
    ApprovalMode, DecisionOption, InterruptRequest, ResumeCommand, ResumeDecision, StatePatch,
};
pub use capability::{
    Capability, CapabilityDescriptor, CapabilityFailure, CapabilityOutput, CapabilityResult,
    CapabilityStatus, FailureKind, SessionContext, TaskDescriptor,
};
pub use error::{PlanningError, StepflowError, StepflowResult};
pub use message::{Message, Role};
pub use workflow::{Decision, Evaluation, Intent, Plan, Step};
