//! Built-in capabilities for the stepflow engine.
//!
//! Lets the engine run end-to-end without real workers: a configurable
//! scripted capability, an echo capability, and the default five-capability
//! catalog with a matching keyword analyzer.
//!
//! # Main entry points
//!
//! - [`register_builtins()`]: Register echo plus the default catalog.
//! - [`register_scripted()`]: Register capabilities from scripted specs.
//! - [`default_analyzer()`]: Keyword analyzer for the default catalog.

/// Default capability catalog and registration helpers.
pub mod catalog;
/// Echo capability.
pub mod echo;
/// Scripted capabilities driven by declarative specs.
pub mod scripted;

pub use catalog::{
    default_analyzer, default_catalog, register_builtins, register_scripted,
    COMPLIANCE_VALIDATION, DATA_ANALYSIS, DOCUMENT_GENERATION, INFORMATION_RETRIEVAL,
    STORAGE_DECISION,
};
pub use echo::EchoCapability;
pub use scripted::{ScriptedCapability, ScriptedSpec};
