//! Datapath section of the agent config and its conversion to domain
//! types.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use domain::bridge::{BridgeChain, ChainId};

use super::common::{default_true, ConfigError};
use crate::constants::{
    DEFAULT_CONNTRACK_QUEUE_CAPACITY, DEFAULT_OVSDB_SOCK, DEFAULT_OVS_RUN_DIR,
    DEFAULT_SETTLE_DELAY,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatapathSectionConfig {
    /// Managed chains: chain id → base bridge name.
    pub managed_bridges: BTreeMap<String, String>,

    #[serde(default = "default_ovs_run_dir")]
    pub ovs_run_dir: String,

    #[serde(default = "default_ovsdb_sock")]
    pub ovsdb_sock: String,

    #[serde(default = "default_true")]
    pub enable_ip_learning: bool,

    #[serde(default)]
    pub enable_proxy: bool,

    #[serde(default)]
    pub enable_overlay: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_gateway: Option<String>,

    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_conntrack_queue")]
    pub conntrack_queue_capacity: usize,

    /// Addresses whitelisted at startup, before the watcher runs.
    #[serde(default)]
    pub internal_ips: Vec<String>,
}

fn default_ovs_run_dir() -> String {
    DEFAULT_OVS_RUN_DIR.to_string()
}

fn default_ovsdb_sock() -> String {
    DEFAULT_OVSDB_SOCK.to_string()
}

fn default_settle_delay_secs() -> u64 {
    DEFAULT_SETTLE_DELAY.as_secs()
}

fn default_conntrack_queue() -> usize {
    DEFAULT_CONNTRACK_QUEUE_CAPACITY
}

impl Default for DatapathSectionConfig {
    fn default() -> Self {
        Self {
            managed_bridges: BTreeMap::new(),
            ovs_run_dir: default_ovs_run_dir(),
            ovsdb_sock: default_ovsdb_sock(),
            enable_ip_learning: true,
            enable_proxy: false,
            enable_overlay: false,
            local_gateway: None,
            settle_delay_secs: default_settle_delay_secs(),
            conntrack_queue_capacity: default_conntrack_queue(),
            internal_ips: Vec::new(),
        }
    }
}

impl DatapathSectionConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.managed_bridges.is_empty() {
            return Err(ConfigError::Validation {
                field: "datapath.managed_bridges".to_string(),
                message: "at least one managed bridge is required".to_string(),
            });
        }
        if self.settle_delay_secs == 0 {
            return Err(ConfigError::Validation {
                field: "datapath.settle_delay_secs".to_string(),
                message: "settle delay must be positive".to_string(),
            });
        }
        if self.conntrack_queue_capacity == 0 {
            return Err(ConfigError::Validation {
                field: "datapath.conntrack_queue_capacity".to_string(),
                message: "queue capacity must be positive".to_string(),
            });
        }
        for ip in &self.internal_ips {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "datapath.internal_ips".to_string(),
                    value: ip.clone(),
                    expected: "an IPv4 address".to_string(),
                })?;
        }
        Ok(())
    }

    /// The managed bridge chains as the domain sees them.
    pub fn chains(&self) -> Vec<BridgeChain> {
        self.managed_bridges
            .iter()
            .map(|(chain, base)| BridgeChain {
                chain: ChainId(chain.clone()),
                base: base.clone(),
                nat_enabled: self.enable_proxy,
                overlay_enabled: self.enable_overlay,
            })
            .collect()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Parsed startup whitelist; call after `validate`.
    pub fn parsed_internal_ips(&self) -> Vec<Ipv4Addr> {
        self.internal_ips
            .iter()
            .filter_map(|ip| ip.parse().ok())
            .collect()
    }
}
