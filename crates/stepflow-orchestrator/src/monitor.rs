use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use stepflow_core::{CapabilityResult, CapabilityStatus, FailureKind};
use tokio::sync::RwLock;

/// Aggregated invocation metrics of one capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetrics {
    /// Attempts, including retries.
    pub invocations: u64,
    /// Invocations that ended successfully.
    pub successes: u64,
    /// Invocations that failed for any reason other than a timeout or cancellation.
    pub failures: u64,
    /// Invocations that hit the step deadline.
    pub timeouts: u64,
    /// Invocations canceled with their session.
    pub canceled: u64,
    /// Invocations currently running.
    pub in_flight: u64,
    /// Total wall time across invocations.
    pub duration_ms: u64,
    /// Tokens reported by successful invocations.
    pub tokens_used: u64,
    /// Status of the most recent invocation.
    pub last_status: Option<CapabilityStatus>,
}

/// Tracks per-capability invocation metrics for operators.
#[derive(Clone)]
pub struct CapabilityMonitor {
    metrics: Arc<RwLock<HashMap<String, CapabilityMetrics>>>,
}

impl CapabilityMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Mark an invocation of `capability` as running.
    pub async fn start_invocation(&self, capability: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(capability.to_string()).or_default().in_flight += 1;
    }

    /// Record the final result of an invocation started with `start_invocation`.
    pub async fn finish_invocation(&self, result: &CapabilityResult) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(result.capability_name.clone()).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.invocations += u64::from(result.attempts);
        entry.duration_ms += result.duration_ms;
        entry.tokens_used += result.tokens_used;
        entry.last_status = Some(result.status);
        match (result.status, result.failure_kind()) {
            (CapabilityStatus::Success, _) => entry.successes += 1,
            (CapabilityStatus::Timeout, _) => entry.timeouts += 1,
            (_, Some(FailureKind::Canceled)) => entry.canceled += 1,
            _ => entry.failures += 1,
        }
    }

    /// Metrics of one capability, if it has run.
    pub async fn get(&self, capability: &str) -> Option<CapabilityMetrics> {
        self.metrics.read().await.get(capability).cloned()
    }

    /// Metrics of every capability seen so far, sorted by name.
    pub async fn snapshot(&self) -> Vec<(String, CapabilityMetrics)> {
        let metrics = self.metrics.read().await;
        let mut all: Vec<_> = metrics
            .iter()
            .map(|(name, m)| (name.clone(), m.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Totals across all capabilities.
    pub async fn aggregate(&self) -> CapabilityMetrics {
        let metrics = self.metrics.read().await;
        let mut total = CapabilityMetrics::default();
        for m in metrics.values() {
            total.invocations += m.invocations;
            total.successes += m.successes;
            total.failures += m.failures;
            total.timeouts += m.timeouts;
            total.canceled += m.canceled;
            total.in_flight += m.in_flight;
            total.duration_ms += m.duration_ms;
            total.tokens_used += m.tokens_used;
        }
        total
    }

    /// Serialize the current metrics as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let capabilities: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .await
            .into_iter()
            .map(|(name, m)| (name, serde_json::to_value(m).unwrap_or_default()))
            .collect();
        serde_json::json!({
            "capabilities": capabilities,
            "aggregate": self.aggregate().await,
        })
    }
}

impl Default for CapabilityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepflow_core::{CapabilityFailure, CapabilityOutput};

    fn success(name: &str, tokens: u64) -> CapabilityResult {
        CapabilityResult::success(
            name,
            CapabilityOutput::new(serde_json::Value::Null, 0.9).with_tokens(tokens),
            Utc::now(),
        )
    }

    fn failure(name: &str, kind: FailureKind) -> CapabilityResult {
        CapabilityResult::failure(name, CapabilityFailure::new(kind, "boom"), Utc::now())
    }

    #[tokio::test]
    async fn test_in_flight_tracking() {
        let monitor = CapabilityMonitor::new();
        monitor.start_invocation("search").await;
        assert_eq!(monitor.get("search").await.unwrap().in_flight, 1);
        monitor.finish_invocation(&success("search", 5)).await;
        let m = monitor.get("search").await.unwrap();
        assert_eq!(m.in_flight, 0);
        assert_eq!(m.successes, 1);
        assert_eq!(m.tokens_used, 5);
        assert_eq!(m.last_status, Some(CapabilityStatus::Success));
    }

    #[tokio::test]
    async fn test_failure_classes() {
        let monitor = CapabilityMonitor::new();
        for kind in [FailureKind::Timeout, FailureKind::Canceled, FailureKind::Validation] {
            monitor.start_invocation("a").await;
            monitor.finish_invocation(&failure("a", kind)).await;
        }
        let m = monitor.get("a").await.unwrap();
        assert_eq!((m.timeouts, m.canceled, m.failures), (1, 1, 1));
        assert_eq!(m.invocations, 3);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = CapabilityMonitor::new();
        monitor.finish_invocation(&success("a", 10).with_attempts(2)).await;
        monitor.finish_invocation(&success("b", 5)).await;
        let total = monitor.aggregate().await;
        assert_eq!(total.invocations, 3);
        assert_eq!(total.tokens_used, 15);

        let json = monitor.to_json().await;
        assert_eq!(json["capabilities"]["a"]["successes"], 1);
        assert_eq!(json["aggregate"]["successes"], 2);
    }
}
