use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/flowsentinel/config.yaml";

/// Directory holding the per-bridge OpenFlow management sockets.
pub const DEFAULT_OVS_RUN_DIR: &str = "/var/run/openvswitch";

/// Suffix of the per-bridge management socket (`<bridge>.mgmt`).
pub const OVS_MGMT_SOCK_SUFFIX: &str = "mgmt";

pub const DEFAULT_OVSDB_SOCK: &str = "/var/run/openvswitch/db.sock";

// ── Channel capacities ─────────────────────────────────────────────

pub const BRIDGE_EVENT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_CONNTRACK_QUEUE_CAPACITY: usize = 5000;

// ── Timing ─────────────────────────────────────────────────────────

/// Delay between installing a new round and sweeping the previous one.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// Interval of the host address poll behind the whitelist watcher.
pub const ADDR_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
