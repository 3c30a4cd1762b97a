use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Operational counters for the topology index.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub(crate) invalidation_passes: Counter,
    pub(crate) invalidation_failures: Counter,
    pub(crate) relation_changes: Counter,
    pub(crate) reports_published: Counter,
    pub(crate) reports_skipped: Counter,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "invalidation_passes",
            "Recomputation passes driven by the invalidation queues",
            metrics.invalidation_passes.clone(),
        );
        registry.register(
            "invalidation_failures",
            "Recomputation passes that failed and were rescheduled",
            metrics.invalidation_failures.clone(),
        );
        registry.register(
            "relation_changes",
            "Relation edge changes dispatched to subscribers",
            metrics.relation_changes.clone(),
        );
        registry.register(
            "reports_published",
            "Pod metadata reports handed to the agent sink",
            metrics.reports_published.clone(),
        );
        registry.register(
            "reports_skipped",
            "Pod metadata reports dropped because the node has no reachable agent",
            metrics.reports_skipped.clone(),
        );
        metrics
    }
}
