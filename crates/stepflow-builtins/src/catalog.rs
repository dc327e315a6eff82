use crate::echo::EchoCapability;
use crate::scripted::{ScriptedCapability, ScriptedSpec};
use std::sync::Arc;
use stepflow_orchestrator::{CapabilityRegistry, KeywordIntentAnalyzer};

/// Performance and sales analysis.
pub const DATA_ANALYSIS: &str = "data_analysis";
/// Reference and record retrieval.
pub const INFORMATION_RETRIEVAL: &str = "information_retrieval";
/// Document drafting; critical.
pub const DOCUMENT_GENERATION: &str = "document_generation";
/// Compliance checks on the drafted document.
pub const COMPLIANCE_VALIDATION: &str = "compliance_validation";
/// Storage decision; critical.
pub const STORAGE_DECISION: &str = "storage_decision";

/// The five standard capabilities and their dependency table.
///
/// Document generation consumes analysis and retrieval; compliance
/// validation checks the document; the storage decision needs both the
/// analysis and the document. Document generation and storage decisions are
/// critical. Analysis and retrieval stand in for each other when one fails;
/// the other three have no substitute.
pub fn default_catalog() -> Vec<ScriptedSpec> {
    vec![
        ScriptedSpec::new(DATA_ANALYSIS)
            .with_description("Analyze performance and sales data")
            .with_base_timeout_secs(30)
            .with_confidence(0.85)
            .with_alternatives([INFORMATION_RETRIEVAL]),
        ScriptedSpec::new(INFORMATION_RETRIEVAL)
            .with_description("Retrieve reference documents and records")
            .with_base_timeout_secs(20)
            .with_confidence(0.8)
            .with_alternatives([DATA_ANALYSIS]),
        ScriptedSpec::new(DOCUMENT_GENERATION)
            .with_description("Draft a document from analysis and retrieved material")
            .depends_on([DATA_ANALYSIS, INFORMATION_RETRIEVAL])
            .critical(true)
            .with_base_timeout_secs(25)
            .with_confidence(0.8),
        ScriptedSpec::new(COMPLIANCE_VALIDATION)
            .with_description("Validate the document against compliance rules")
            .depends_on([DOCUMENT_GENERATION])
            .with_base_timeout_secs(15)
            .with_confidence(0.9),
        ScriptedSpec::new(STORAGE_DECISION)
            .with_description("Decide where and whether to store the results")
            .depends_on([DATA_ANALYSIS, DOCUMENT_GENERATION])
            .critical(true)
            .with_base_timeout_secs(10)
            .with_confidence(0.9),
    ]
}

/// Keyword analyzer matching the default catalog; falls back to data analysis.
pub fn default_analyzer() -> KeywordIntentAnalyzer {
    KeywordIntentAnalyzer::default()
        .rule(
            DATA_ANALYSIS,
            ["analy", "performance", "trend", "statistic", "sales", "metric", "forecast"],
        )
        .rule(
            INFORMATION_RETRIEVAL,
            ["search", "find", "retriev", "look up", "lookup", "reference", "information"],
        )
        .rule(
            DOCUMENT_GENERATION,
            ["report", "document", "draft", "write", "generat", "summar"],
        )
        .rule(
            COMPLIANCE_VALIDATION,
            ["complian", "regulat", "policy", "validat", "audit", "rule"],
        )
        .rule(STORAGE_DECISION, ["store", "storage", "save", "archive", "persist"])
        .with_fallback(DATA_ANALYSIS)
}

/// Register every spec in `specs` as a [`ScriptedCapability`].
pub fn register_scripted(registry: &mut CapabilityRegistry, specs: Vec<ScriptedSpec>) {
    for spec in specs {
        registry.register(Arc::new(ScriptedCapability::new(spec)));
    }
}

/// Register the echo capability plus the default catalog.
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    registry.register(Arc::new(EchoCapability::new()));
    register_scripted(registry, default_catalog());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_dependency_table() {
        let mut registry = CapabilityRegistry::new();
        register_builtins(&mut registry);
        assert_eq!(registry.len(), 6);

        let storage = registry.descriptor(STORAGE_DECISION).unwrap();
        assert!(storage.critical);
        assert_eq!(storage.depends_on, vec![DATA_ANALYSIS, DOCUMENT_GENERATION]);
        assert_eq!(
            registry.descriptor(COMPLIANCE_VALIDATION).unwrap().base_timeout_secs,
            15
        );
        assert!(!registry.descriptor(DATA_ANALYSIS).unwrap().critical);
        assert_eq!(
            registry.descriptor(DATA_ANALYSIS).unwrap().alternatives,
            vec![INFORMATION_RETRIEVAL]
        );
        assert_eq!(
            registry.descriptor(INFORMATION_RETRIEVAL).unwrap().alternatives,
            vec![DATA_ANALYSIS]
        );
        assert!(registry.descriptor(DOCUMENT_GENERATION).unwrap().alternatives.is_empty());
    }

    #[test]
    fn test_default_analyzer_routes_queries() {
        let analyzer = default_analyzer();
        let intent = analyzer.analyze_query("Find recent sales data and write a compliance report");
        assert_eq!(
            intent.capabilities,
            vec![
                DATA_ANALYSIS,
                INFORMATION_RETRIEVAL,
                DOCUMENT_GENERATION,
                COMPLIANCE_VALIDATION
            ]
        );
        assert!(intent.clarification_needed);

        let fallback = analyzer.analyze_query("hello there");
        assert_eq!(fallback.capabilities, vec![DATA_ANALYSIS]);
    }
}
