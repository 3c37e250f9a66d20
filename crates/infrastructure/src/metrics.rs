use ports::secondary::metrics_port::{ConntrackMetrics, FlowMetrics, ReplayMetrics};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BridgeLabels {
    pub bridge: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChainLabels {
    pub chain: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReplayLabels {
    pub chain: String,
    pub result: String,
}

// ── Agent metrics registry ──────────────────────────────────────────

/// Prometheus metrics registry for the datapath agent.
///
/// All metric families use interior mutability (atomics), so recording
/// only requires `&self`. Wrap in `Arc` for multi-task sharing.
pub struct AgentMetrics {
    registry: Registry,
    pub flows_installed_total: Family<BridgeLabels, Counter>,
    pub flows_deleted_total: Family<BridgeLabels, Counter>,
    pub rules_loaded: Gauge,
    pub replays_total: Family<ReplayLabels, Counter>,
    pub current_round: Family<ChainLabels, Gauge>,
    pub conntrack_batches_total: Counter,
    pub conntrack_rules_cleaned_total: Counter,
    pub conntrack_flushes_total: Counter,
}

impl AgentMetrics {
    /// Create a registry with every metric registered under the
    /// `flowsentinel` prefix.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("flowsentinel");

        let flows_installed_total = Family::<BridgeLabels, Counter>::default();
        registry.register(
            "flows_installed",
            "Total flows installed, by bridge kind",
            flows_installed_total.clone(),
        );

        let flows_deleted_total = Family::<BridgeLabels, Counter>::default();
        registry.register(
            "flows_deleted",
            "Total flows deleted, by bridge kind",
            flows_deleted_total.clone(),
        );

        let rules_loaded = Gauge::default();
        registry.register(
            "rules_loaded",
            "Rule entries currently in the store",
            rules_loaded.clone(),
        );

        let replays_total = Family::<ReplayLabels, Counter>::default();
        registry.register(
            "replays",
            "Completed replays, by chain and result",
            replays_total.clone(),
        );

        let current_round = Family::<ChainLabels, Gauge>::default();
        registry.register(
            "current_round",
            "Restart round flows are currently installed under",
            current_round.clone(),
        );

        let conntrack_batches_total = Counter::default();
        registry.register(
            "conntrack_batches",
            "Batched conntrack predicate deletes",
            conntrack_batches_total.clone(),
        );

        let conntrack_rules_cleaned_total = Counter::default();
        registry.register(
            "conntrack_rules_cleaned",
            "Rule predicates handed to conntrack deletion",
            conntrack_rules_cleaned_total.clone(),
        );

        let conntrack_flushes_total = Counter::default();
        registry.register(
            "conntrack_flushes",
            "Full conntrack table flushes",
            conntrack_flushes_total.clone(),
        );

        Self {
            registry,
            flows_installed_total,
            flows_deleted_total,
            rules_loaded,
            replays_total,
            current_round,
            conntrack_batches_total,
            conntrack_rules_cleaned_total,
            conntrack_flushes_total,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        encode(&mut out, &self.registry).expect("text encoding never fails");
        out
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowMetrics for AgentMetrics {
    fn record_flow_installed(&self, bridge: &str) {
        self.flows_installed_total
            .get_or_create(&BridgeLabels {
                bridge: bridge.to_string(),
            })
            .inc();
    }

    fn record_flow_deleted(&self, bridge: &str) {
        self.flows_deleted_total
            .get_or_create(&BridgeLabels {
                bridge: bridge.to_string(),
            })
            .inc();
    }

    fn set_rules_loaded(&self, count: u64) {
        self.rules_loaded.set(count as i64);
    }
}

impl ReplayMetrics for AgentMetrics {
    fn record_replay(&self, chain: &str, result: &str) {
        self.replays_total
            .get_or_create(&ReplayLabels {
                chain: chain.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    fn set_current_round(&self, chain: &str, round: u8) {
        self.current_round
            .get_or_create(&ChainLabels {
                chain: chain.to_string(),
            })
            .set(i64::from(round));
    }
}

impl ConntrackMetrics for AgentMetrics {
    fn record_conntrack_batch(&self, rules: u64) {
        self.conntrack_batches_total.inc();
        self.conntrack_rules_cleaned_total.inc_by(rules);
    }

    fn record_conntrack_flush(&self) {
        self.conntrack_flushes_total.inc();
    }
}
