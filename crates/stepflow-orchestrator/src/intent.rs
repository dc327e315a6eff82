//! Intent analysis: which capabilities a query needs and how complex it is.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepflow_core::{Intent, StepflowResult};

/// Turns a user query into an [`Intent`].
///
/// The engine treats the analyzer as an injected collaborator; an error is
/// recorded and retried within the session's iteration budget.
#[async_trait]
pub trait IntentAnalyzer: Send + Sync {
    /// Turn a user query into the capabilities it requests.
    async fn analyze(&self, query: &str) -> StepflowResult<Intent>;
}

/// Maps a capability to the words that request it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Capability requested when a keyword matches.
    pub capability: String,
    /// Single words match any query word they prefix (`analy` matches
    /// `analysis`); multi-word phrases must appear verbatim.
    pub keywords: Vec<String>,
}

impl KeywordRule {
    /// A rule requesting `capability` for any of `keywords`.
    pub fn new<I, S>(capability: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capability: capability.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }
}

const OPERATION_TERMS: &[&str] = &[
    "analyze", "analyse", "compare", "summarize", "generate", "create", "write", "validate",
    "verify", "calculate", "forecast", "search", "store", "review",
];

const CONDITION_TERMS: &[&str] = &[
    "if", "unless", "when", "only", "except", "before", "after", "between", "and", "or", "but",
];

const VAGUE_TIME_TERMS: &[&str] = &[
    "recent", "recently", "lately", "soon", "later", "sometime", "someday", "eventually",
];

const VAGUE_QUANTITY_TERMS: &[&str] = &[
    "some", "many", "few", "several", "lots", "various", "numerous", "enough",
];

/// Deterministic keyword-based analyzer.
///
/// Capabilities are reported in rule order. When nothing matches, the
/// fallback capability (if any) is requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordIntentAnalyzer {
    /// Checked in order.
    #[serde(default)]
    pub rules: Vec<KeywordRule>,
    /// Requested when no rule matches.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl KeywordIntentAnalyzer {
    /// An analyzer over `rules`.
    pub fn new(rules: Vec<KeywordRule>, fallback: Option<String>) -> Self {
        Self { rules, fallback }
    }

    /// Append a rule; earlier rules report first.
    pub fn rule<I, S>(mut self, capability: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(KeywordRule::new(capability, keywords));
        self
    }

    /// Capability requested when no rule matches.
    pub fn with_fallback(mut self, capability: impl Into<String>) -> Self {
        self.fallback = Some(capability.into());
        self
    }

    /// Analyze synchronously; the async trait method delegates here.
    pub fn analyze_query(&self, query: &str) -> Intent {
        let normalized = query.to_lowercase();
        let words = tokenize(&normalized);
        let phrase_text = words.join(" ");

        let mut capabilities: Vec<String> = Vec::new();
        for rule in &self.rules {
            let hit = rule.keywords.iter().any(|kw| {
                let kw = kw.to_lowercase();
                if kw.contains(' ') {
                    phrase_text.contains(&kw)
                } else {
                    words.iter().any(|w| w.starts_with(&kw))
                }
            });
            if hit && !capabilities.contains(&rule.capability) {
                capabilities.push(rule.capability.clone());
            }
        }
        if capabilities.is_empty() {
            if let Some(fallback) = &self.fallback {
                capabilities.push(fallback.clone());
            }
        }

        let ambiguities: Vec<String> = words
            .iter()
            .filter(|w| {
                VAGUE_TIME_TERMS.contains(&w.as_str()) || VAGUE_QUANTITY_TERMS.contains(&w.as_str())
            })
            .fold(Vec::new(), |mut acc, w| {
                if !acc.contains(w) {
                    acc.push(w.clone());
                }
                acc
            });

        let complexity = complexity_score(query, &words, capabilities.len());
        Intent {
            query: query.to_string(),
            capabilities,
            complexity,
            clarification_needed: !ambiguities.is_empty(),
            ambiguities,
        }
    }
}

#[async_trait]
impl IntentAnalyzer for KeywordIntentAnalyzer {
    async fn analyze(&self, query: &str) -> StepflowResult<Intent> {
        Ok(self.analyze_query(query))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Average of four factors in `0.0..=1.0`, rounded to two decimals:
/// query length, operation words, condition words and capability breadth.
fn complexity_score(query: &str, words: &[String], capabilities: usize) -> f64 {
    let count = |terms: &[&str]| words.iter().filter(|w| terms.contains(&w.as_str())).count();

    let length = (query.chars().count() as f64 / 500.0).min(1.0);
    let operations = (count(OPERATION_TERMS) as f64 * 0.1).min(1.0);
    let conditions = (count(CONDITION_TERMS) as f64 * 0.1).min(1.0);
    let breadth = (capabilities.saturating_sub(1) as f64 * 0.25).min(1.0);

    let score = ((length + operations + conditions + breadth) / 4.0).min(1.0);
    (score * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn analyzer() -> KeywordIntentAnalyzer {
        KeywordIntentAnalyzer::default()
            .rule("analysis", ["analy", "trend"])
            .rule("document", ["report", "write up"])
            .with_fallback("analysis")
    }

    #[tokio::test]
    async fn test_matches_rules_in_rule_order() {
        let intent = analyzer()
            .analyze("Write up a report on the sales trends")
            .await
            .unwrap();
        assert_eq!(intent.capabilities, vec!["analysis", "document"]);
        assert!(intent.ambiguities.is_empty());
        assert!(!intent.clarification_needed);
    }

    #[test]
    fn test_fallback_when_nothing_matches() {
        let intent = analyzer().analyze_query("hello there");
        assert_eq!(intent.capabilities, vec!["analysis"]);

        let bare = KeywordIntentAnalyzer::default().analyze_query("hello there");
        assert!(bare.capabilities.is_empty());
    }

    #[test]
    fn test_prefix_match_is_word_bound() {
        // "analysis" is a prefix match; "psychoanalysis" is not.
        let intent = KeywordIntentAnalyzer::default()
            .rule("analysis", ["analy"])
            .analyze_query("psychoanalysis books");
        assert!(intent.capabilities.is_empty());
    }

    #[test]
    fn test_ambiguity_detection() {
        let intent = analyzer().analyze_query("Analyze some recent numbers, some of them");
        assert_eq!(intent.ambiguities, vec!["some", "recent"]);
        assert!(intent.clarification_needed);
    }

    #[test]
    fn test_complexity_is_bounded_and_rounded() {
        let simple = analyzer().analyze_query("trend");
        assert_eq!(simple.complexity, 0.0);

        let long = "analyze and compare if only when before after ".repeat(40);
        let intent = analyzer().analyze_query(&long);
        assert!(intent.complexity > 0.5);
        assert!(intent.complexity <= 1.0);
        assert_eq!(intent.complexity, (intent.complexity * 100.0).round() / 100.0);
    }
}
