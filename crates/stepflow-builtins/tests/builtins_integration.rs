#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Runs the built-in catalog through a real engine.

use std::sync::Arc;
use stepflow_builtins::*;
use stepflow_core::{ApprovalMode, DecisionOption, ResumeCommand};
use stepflow_orchestrator::{CapabilityRegistry, EngineConfig, WorkflowEngine};
use stepflow_session::SessionStatus;

fn engine(approval_mode: ApprovalMode) -> WorkflowEngine {
    let mut registry = CapabilityRegistry::new();
    register_builtins(&mut registry);
    WorkflowEngine::builder()
        .config(EngineConfig {
            approval_mode,
            ..EngineConfig::default()
        })
        .registry(registry)
        .analyzer(Arc::new(default_analyzer().rule("echo", ["echo"])))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_catalog_runs_to_completion_in_dependency_order() {
    let engine = engine(ApprovalMode::None);
    let handle = engine
        .start(
            Some("catalog".into()),
            "Analyze sales, find references, write a report, check compliance and store it",
        )
        .await
        .unwrap();
    assert_eq!(handle.report.status, SessionStatus::Completed);

    let response = handle.report.final_response.unwrap();
    let order: Vec<&str> = response["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["capability"].as_str().unwrap())
        .collect();
    let position = |name: &str| order.iter().position(|c| *c == name).unwrap();
    assert_eq!(order.len(), 5);
    assert!(position(DOCUMENT_GENERATION) > position(DATA_ANALYSIS));
    assert!(position(DOCUMENT_GENERATION) > position(INFORMATION_RETRIEVAL));
    assert!(position(COMPLIANCE_VALIDATION) > position(DOCUMENT_GENERATION));
    assert!(position(STORAGE_DECISION) > position(DOCUMENT_GENERATION));

    let session = engine.session("catalog").await.unwrap();
    let document = &session.capability_results[DOCUMENT_GENERATION].payload;
    assert_eq!(
        document["inputs"],
        serde_json::json!([DATA_ANALYSIS, INFORMATION_RETRIEVAL])
    );
}

#[tokio::test]
async fn test_unmatched_query_falls_back_to_data_analysis() {
    let engine = engine(ApprovalMode::CriticalOnly);
    let handle = engine.start(None, "hello there").await.unwrap();
    assert_eq!(handle.report.status, SessionStatus::Completed);
    let plan = engine.plan(&handle.report.session_id).await.unwrap();
    assert_eq!(plan.requested, vec![DATA_ANALYSIS]);
}

#[tokio::test]
async fn test_echo_returns_the_query() {
    let engine = engine(ApprovalMode::None);
    let handle = engine.start(None, "echo this back").await.unwrap();
    let response = handle.report.final_response.unwrap();
    assert_eq!(response["results"][0]["capability"], "echo");
    assert_eq!(
        response["results"][0]["payload"]["echo"]["query"],
        "echo this back"
    );
}

#[tokio::test]
async fn test_approve_all_gates_every_step() {
    let engine = engine(ApprovalMode::All);
    let mut handle = engine
        .start(Some("all".into()), "store the sales analysis")
        .await
        .unwrap();
    let mut approvals = 0;
    while let Some(interrupt) = handle.report.interrupt.clone() {
        handle = engine
            .resume(
                "all",
                ResumeCommand::new(interrupt.interrupt_id, DecisionOption::Approve),
            )
            .await
            .unwrap();
        approvals += 1;
    }
    assert_eq!(handle.report.status, SessionStatus::Completed);
    // Only requested capabilities are planned: data_analysis, then storage_decision.
    assert_eq!(approvals, 2);
}
