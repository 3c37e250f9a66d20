// Focused metric traits with no-op defaults, so test mocks implement only
// what the code under test records. All methods take `&self`; the backing
// implementation uses interior mutability.

/// Flow-plane metrics.
pub trait FlowMetrics: Send + Sync {
    /// Record one flow installed on the given bridge kind.
    fn record_flow_installed(&self, _bridge: &str) {}

    /// Record one flow deleted.
    fn record_flow_deleted(&self, _bridge: &str) {}

    /// Set the number of rule entries currently in the store.
    fn set_rules_loaded(&self, _count: u64) {}
}

/// Replay / round metrics.
pub trait ReplayMetrics: Send + Sync {
    /// Record a completed replay for a chain with result label
    /// (`"ok"` / `"error"`).
    fn record_replay(&self, _chain: &str, _result: &str) {}

    /// Set the current restart round of a chain.
    fn set_current_round(&self, _chain: &str, _round: u8) {}
}

/// Conntrack cleaner metrics.
pub trait ConntrackMetrics: Send + Sync {
    /// Record a batched predicate delete of `n` rules.
    fn record_conntrack_batch(&self, _rules: u64) {}

    /// Record a full table flush.
    fn record_conntrack_flush(&self) {}
}

/// Everything the datapath records, in one object-safe bundle.
pub trait DatapathMetrics: FlowMetrics + ReplayMetrics + ConntrackMetrics {}

impl<T: FlowMetrics + ReplayMetrics + ConntrackMetrics> DatapathMetrics for T {}
