//! Per-field merge rules applied to every [`PartialUpdate`].
//!
//! Rules are chosen so that the updates sibling invocations of one step
//! produce commute:
//!
//! - log entries are merged in `(timestamp, origin, text)` order rather than
//!   arrival order, and a cap keeps the newest entries;
//! - counters are summed;
//! - maps are merged key by key;
//! - sets are unioned.
//!
//! Only scalar fields are last-writer-wins, and sibling updates never set them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use stepflow_core::{CapabilityResult, Message, StepflowError, StepflowResult};

use crate::session::{AuditRecord, ErrorRecord, Session, WarningRecord};
use crate::update::PartialUpdate;

/// Shape of a session field, which constrains the rules it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Append-only entries.
    Log,
    /// A number that only grows.
    Counter,
    /// A keyed map.
    Map,
    /// A set of keys.
    Set,
    /// A single value.
    Scalar,
}

/// A session field that accepts a merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// [`Session::messages`].
    Messages,
    /// [`Session::errors`].
    Errors,
    /// [`Session::warnings`].
    Warnings,
    /// [`Session::audit_trail`].
    AuditTrail,
    /// [`Session::iteration_count`].
    IterationCount,
    /// [`Session::total_tokens_used`].
    TotalTokensUsed,
    /// [`Session::capability_results`].
    CapabilityResults,
    /// [`Session::call_counts`].
    CallCounts,
    /// [`Session::task_overrides`].
    TaskOverrides,
    /// [`Session::step_decisions`].
    StepDecisions,
    /// [`Session::completed_steps`].
    CompletedSteps,
    /// [`Session::resolved_interrupts`].
    ResolvedInterrupts,
    /// [`Session::status`].
    Status,
    /// [`Session::intent`].
    Intent,
    /// [`Session::pending_interrupt`].
    PendingInterrupt,
    /// [`Session::last_evaluation`].
    LastEvaluation,
    /// [`Session::final_response`].
    FinalResponse,
    /// [`Session::failure_reason`].
    FailureReason,
}

impl Field {
    /// Every field, in declaration order.
    pub const ALL: [Field; 18] = [
        Field::Messages,
        Field::Errors,
        Field::Warnings,
        Field::AuditTrail,
        Field::IterationCount,
        Field::TotalTokensUsed,
        Field::CapabilityResults,
        Field::CallCounts,
        Field::TaskOverrides,
        Field::StepDecisions,
        Field::CompletedSteps,
        Field::ResolvedInterrupts,
        Field::Status,
        Field::Intent,
        Field::PendingInterrupt,
        Field::LastEvaluation,
        Field::FinalResponse,
        Field::FailureReason,
    ];

    /// The shape of this field.
    pub fn kind(self) -> FieldKind {
        match self {
            Field::Messages | Field::Errors | Field::Warnings | Field::AuditTrail => FieldKind::Log,
            Field::IterationCount | Field::TotalTokensUsed => FieldKind::Counter,
            Field::CapabilityResults
            | Field::CallCounts
            | Field::TaskOverrides
            | Field::StepDecisions => FieldKind::Map,
            Field::CompletedSteps | Field::ResolvedInterrupts => FieldKind::Set,
            Field::Status
            | Field::Intent
            | Field::PendingInterrupt
            | Field::LastEvaluation
            | Field::FinalResponse
            | Field::FailureReason => FieldKind::Scalar,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(json.as_str().unwrap_or_default())
    }
}

/// How a field absorbs an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MergeRule {
    /// Ordered merge of log entries, keeping at most `cap` of the newest.
    Append {
        /// Entries kept; unbounded when `None`.
        cap: Option<usize>,
    },
    /// Values are added.
    Sum,
    /// Maps are merged key by key. Colliding numbers are summed, colliding
    /// capability results keep the later `finished_at`, anything else is
    /// overwritten.
    KeyedMerge,
    /// Set union.
    Union,
    /// The incoming value replaces the current one.
    LastWriterWins,
}

impl MergeRule {
    /// Whether this rule can merge a field of `kind`.
    pub fn accepts(self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (MergeRule::Append { .. }, FieldKind::Log)
                | (MergeRule::Sum, FieldKind::Counter)
                | (MergeRule::KeyedMerge, FieldKind::Map)
                | (MergeRule::LastWriterWins, FieldKind::Map)
                | (MergeRule::Union, FieldKind::Set)
                | (MergeRule::LastWriterWins, FieldKind::Scalar)
        )
    }
}

/// Default caps for the append-only logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCaps {
    /// Conversation messages kept; unbounded when `None`.
    pub messages: Option<usize>,
    /// Error records kept; unbounded when `None`.
    pub errors: Option<usize>,
    /// Warning records kept; unbounded when `None`.
    pub warnings: Option<usize>,
    /// Audit records kept; 200 by default.
    pub audit_trail: Option<usize>,
}

impl Default for LogCaps {
    fn default() -> Self {
        Self {
            messages: None,
            errors: None,
            warnings: None,
            audit_trail: Some(200),
        }
    }
}

/// The registered merge rule of every session field.
#[derive(Debug, Clone)]
pub struct ReducerTable {
    rules: HashMap<Field, MergeRule>,
}

impl Default for ReducerTable {
    fn default() -> Self {
        Self::with_caps(LogCaps::default())
    }
}

impl ReducerTable {
    /// The default rule of every field, with `caps` on the logs.
    pub fn with_caps(caps: LogCaps) -> Self {
        let mut rules = HashMap::new();
        for field in Field::ALL {
            let rule = match field.kind() {
                FieldKind::Log => MergeRule::Append {
                    cap: match field {
                        Field::Messages => caps.messages,
                        Field::Errors => caps.errors,
                        Field::Warnings => caps.warnings,
                        _ => caps.audit_trail,
                    },
                },
                FieldKind::Counter => MergeRule::Sum,
                FieldKind::Map => MergeRule::KeyedMerge,
                FieldKind::Set => MergeRule::Union,
                FieldKind::Scalar => MergeRule::LastWriterWins,
            };
            rules.insert(field, rule);
        }
        Self { rules }
    }

    /// Replace the rule of `field`. Rules of the wrong kind are rejected.
    pub fn register(&mut self, field: Field, rule: MergeRule) -> StepflowResult<()> {
        if !rule.accepts(field.kind()) {
            return Err(StepflowError::Config(format!(
                "merge rule {rule:?} cannot be applied to {:?} field '{field}'",
                field.kind()
            )));
        }
        self.rules.insert(field, rule);
        Ok(())
    }

    /// The rule registered for `field`.
    pub fn rule(&self, field: Field) -> MergeRule {
        self.rules
            .get(&field)
            .copied()
            .unwrap_or(MergeRule::LastWriterWins)
    }

    /// All rules, ordered by field.
    pub fn rules(&self) -> BTreeMap<Field, MergeRule> {
        self.rules.iter().map(|(f, r)| (*f, *r)).collect()
    }

    /// Merge `update` into `session` and bump its version.
    pub fn apply(&self, session: &mut Session, update: PartialUpdate) {
        merge_log(&mut session.messages, update.messages, self.cap(Field::Messages));
        merge_log(&mut session.errors, update.errors, self.cap(Field::Errors));
        merge_log(&mut session.warnings, update.warnings, self.cap(Field::Warnings));
        merge_log(
            &mut session.audit_trail,
            update.audit_trail,
            self.cap(Field::AuditTrail),
        );

        session.iteration_count = session
            .iteration_count
            .saturating_add(update.iteration_count);
        session.total_tokens_used = session
            .total_tokens_used
            .saturating_add(update.total_tokens_used);

        self.merge_map(
            Field::CapabilityResults,
            &mut session.capability_results,
            update.capability_results,
            newer_result,
        );
        self.merge_map(
            Field::CallCounts,
            &mut session.call_counts,
            update.call_counts,
            |current, incoming| current.saturating_add(incoming),
        );
        self.merge_map(
            Field::TaskOverrides,
            &mut session.task_overrides,
            update.task_overrides,
            |_, incoming| incoming,
        );
        self.merge_map(
            Field::StepDecisions,
            &mut session.step_decisions,
            update.step_decisions,
            |_, incoming| incoming,
        );

        session.completed_steps.extend(update.completed_steps);
        session.resolved_interrupts.extend(update.resolved_interrupts);

        if let Some(status) = update.status {
            session.status = status;
        }
        if let Some(intent) = update.intent {
            session.intent = Some(intent);
        }
        if let Some(pending) = update.pending_interrupt {
            session.pending_interrupt = pending;
        }
        if let Some(evaluation) = update.last_evaluation {
            session.last_evaluation = Some(evaluation);
        }
        if let Some(response) = update.final_response {
            session.final_response = Some(response);
        }
        if let Some(reason) = update.failure_reason {
            session.failure_reason = Some(reason);
        }

        session.version += 1;
        session.updated_at = session.updated_at.max(Utc::now());
    }

    fn cap(&self, field: Field) -> Option<usize> {
        match self.rule(field) {
            MergeRule::Append { cap } => cap,
            _ => None,
        }
    }

    fn merge_map<V>(
        &self,
        field: Field,
        current: &mut BTreeMap<String, V>,
        incoming: BTreeMap<String, V>,
        combine: impl Fn(V, V) -> V,
    ) {
        if incoming.is_empty() {
            return;
        }
        if self.rule(field) == MergeRule::LastWriterWins {
            *current = incoming;
            return;
        }
        for (key, value) in incoming {
            let merged = match current.remove(&key) {
                Some(existing) => combine(existing, value),
                None => value,
            };
            current.insert(key, merged);
        }
    }
}

fn newer_result(current: CapabilityResult, incoming: CapabilityResult) -> CapabilityResult {
    if current.finished_at > incoming.finished_at {
        current
    } else {
        incoming
    }
}

/// An entry of an append-only log, ordered by its merge key.
pub trait LogEntry: Serialize {
    fn merge_key(&self) -> (chrono::DateTime<Utc>, &str, &str);
}

impl LogEntry for Message {
    fn merge_key(&self) -> (chrono::DateTime<Utc>, &str, &str) {
        (self.timestamp, &self.origin, &self.content)
    }
}

impl LogEntry for ErrorRecord {
    fn merge_key(&self) -> (chrono::DateTime<Utc>, &str, &str) {
        (self.timestamp, &self.origin, &self.message)
    }
}

impl LogEntry for WarningRecord {
    fn merge_key(&self) -> (chrono::DateTime<Utc>, &str, &str) {
        (self.timestamp, &self.origin, &self.message)
    }
}

impl LogEntry for AuditRecord {
    fn merge_key(&self) -> (chrono::DateTime<Utc>, &str, &str) {
        (self.timestamp, &self.origin, &self.event)
    }
}

fn compare_entries<T: LogEntry>(a: &T, b: &T) -> Ordering {
    a.merge_key().cmp(&b.merge_key()).then_with(|| {
        // Full-key ties are rare; fall back to the serialized form so the
        // order never depends on arrival.
        let a = serde_json::to_string(a).unwrap_or_default();
        let b = serde_json::to_string(b).unwrap_or_default();
        a.cmp(&b)
    })
}

fn merge_log<T: LogEntry>(log: &mut Vec<T>, incoming: Vec<T>, cap: Option<usize>) {
    if incoming.is_empty() {
        return;
    }
    log.extend(incoming);
    log.sort_by(compare_entries);
    if let Some(cap) = cap {
        if log.len() > cap {
            let excess = log.len() - cap;
            log.drain(..excess);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stepflow_core::{CapabilityFailure, CapabilityOutput, FailureKind};

    fn audit_at(offset_ms: i64, event: &str) -> AuditRecord {
        let mut record = AuditRecord::new("engine", event);
        record.timestamp = Utc::now() + Duration::milliseconds(offset_ms);
        record
    }

    #[test]
    fn test_register_rejects_mismatched_kind() {
        let mut table = ReducerTable::default();
        assert!(table.register(Field::Messages, MergeRule::Sum).is_err());
        assert!(table.register(Field::Status, MergeRule::Union).is_err());
        assert!(table
            .register(Field::Messages, MergeRule::Append { cap: Some(50) })
            .is_ok());
        assert_eq!(table.rule(Field::Messages), MergeRule::Append { cap: Some(50) });
    }

    #[test]
    fn test_default_rules() {
        let table = ReducerTable::default();
        assert_eq!(
            table.rule(Field::AuditTrail),
            MergeRule::Append { cap: Some(200) }
        );
        assert_eq!(table.rule(Field::CallCounts), MergeRule::KeyedMerge);
        assert_eq!(table.rule(Field::IterationCount), MergeRule::Sum);
        assert_eq!(table.rule(Field::Status), MergeRule::LastWriterWins);
        assert_eq!(table.rules().len(), Field::ALL.len());
    }

    #[test]
    fn test_audit_cap_keeps_newest() {
        let table = ReducerTable::with_caps(LogCaps {
            audit_trail: Some(3),
            ..LogCaps::default()
        });
        let mut session = Session::new(None, "q");
        let mut update = PartialUpdate::new();
        for i in 0..5 {
            update = update.audit(audit_at(i, &format!("e{i}")));
        }
        table.apply(&mut session, update);
        let events: Vec<_> = session.audit_trail.iter().map(|a| a.event.as_str()).collect();
        assert_eq!(events, ["e2", "e3", "e4"]);
    }

    #[test]
    fn test_log_merge_orders_by_timestamp() {
        let table = ReducerTable::default();
        let mut session = Session::new(None, "q");
        table.apply(&mut session, PartialUpdate::new().audit(audit_at(10, "late")));
        table.apply(&mut session, PartialUpdate::new().audit(audit_at(0, "early")));
        assert_eq!(session.audit_trail[0].event, "early");
        assert_eq!(session.version, 2);
    }

    #[test]
    fn test_counters_and_call_counts_sum() {
        let table = ReducerTable::default();
        let mut session = Session::new(None, "q");
        let mut first = PartialUpdate::new().next_iteration();
        first.call_counts.insert("a".into(), 2);
        let mut second = PartialUpdate::new().next_iteration();
        second.call_counts.insert("a".into(), 1);
        table.apply(&mut session, first);
        table.apply(&mut session, second);
        assert_eq!(session.iteration_count, 2);
        assert_eq!(session.call_counts["a"], 3);
    }

    #[test]
    fn test_capability_results_keep_newer() {
        let table = ReducerTable::default();
        let mut session = Session::new(None, "q");
        let started = Utc::now();
        let mut newer = CapabilityResult::success(
            "a",
            CapabilityOutput::new(serde_json::json!("new"), 0.9),
            started,
        );
        newer.finished_at = started + Duration::seconds(5);
        let older = CapabilityResult::failure(
            "a",
            CapabilityFailure::new(FailureKind::Transient, "flaky"),
            started,
        );
        table.apply(&mut session, PartialUpdate::new().result(newer));
        table.apply(&mut session, PartialUpdate::new().result(older));
        assert!(session.capability_results["a"].is_success());
        assert_eq!(session.call_counts["a"], 2);
    }

    #[test]
    fn test_last_writer_wins_map_replaces() {
        let mut table = ReducerTable::default();
        table
            .register(Field::TaskOverrides, MergeRule::LastWriterWins)
            .unwrap();
        let mut session = Session::new(None, "q");
        let mut first = PartialUpdate::new();
        first.task_overrides.insert("a".into(), serde_json::json!(1));
        let mut second = PartialUpdate::new();
        second.task_overrides.insert("b".into(), serde_json::json!(2));
        table.apply(&mut session, first);
        table.apply(&mut session, second);
        assert_eq!(session.task_overrides.len(), 1);
        assert!(session.task_overrides.contains_key("b"));
    }

    #[test]
    fn test_scalars_and_clearing_interrupt() {
        let table = ReducerTable::default();
        let mut session = Session::new(None, "q");
        table.apply(
            &mut session,
            PartialUpdate::new()
                .status(crate::SessionStatus::Completed)
                .failure("none"),
        );
        assert_eq!(session.status, crate::SessionStatus::Completed);
        table.apply(&mut session, PartialUpdate::new().interrupt(None));
        assert!(session.pending_interrupt.is_none());
        assert_eq!(session.failure_reason.as_deref(), Some("none"));
    }

    #[test]
    fn test_field_display() {
        assert_eq!(Field::AuditTrail.to_string(), "audit_trail");
    }
}
