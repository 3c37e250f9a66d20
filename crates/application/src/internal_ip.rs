//! Internal-IP whitelist: every non-loopback IPv4 on the host gets a pair
//! of allow-all rules (ingress and egress) at Tier3, tracked against
//! address add/remove events.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use domain::bridge::{INTERNAL_EGRESS_RULE_PREFIX, INTERNAL_INGRESS_RULE_PREFIX};
use domain::common::entity::{Direction, EnforcementMode, PolicyTier, RuleReference};
use domain::common::error::DatapathError;
use domain::rule::entity::{internal_egress_rule, internal_ingress_rule};
use ports::secondary::addr_watch_port::{AddrWatchPort, AddressEvent};

use crate::manager::DatapathManager;

impl DatapathManager {
    /// Whitelist one host address: allow-all ingress and egress rules
    /// owned by the well-known internal policies.
    pub async fn add_internal_ip(&self, ip: Ipv4Addr, ifindex: u32) -> Result<(), DatapathError> {
        let suffix = format!("{ip}-{ifindex}");
        self.add_policy_rule(
            internal_ingress_rule(ip),
            RuleReference(format!("{INTERNAL_INGRESS_RULE_PREFIX}{suffix}")),
            Direction::Ingress,
            PolicyTier::Tier3,
            EnforcementMode::Work,
        )
        .await?;
        self.add_policy_rule(
            internal_egress_rule(ip),
            RuleReference(format!("{INTERNAL_EGRESS_RULE_PREFIX}{suffix}")),
            Direction::Egress,
            PolicyTier::Tier3,
            EnforcementMode::Work,
        )
        .await
    }

    pub async fn remove_internal_ip(
        &self,
        ip: Ipv4Addr,
        ifindex: u32,
    ) -> Result<(), DatapathError> {
        let suffix = format!("{ip}-{ifindex}");
        self.remove_policy_rule(
            &internal_ingress_rule(ip).id,
            &RuleReference(format!("{INTERNAL_INGRESS_RULE_PREFIX}{suffix}")),
        )
        .await?;
        self.remove_policy_rule(
            &internal_egress_rule(ip).id,
            &RuleReference(format!("{INTERNAL_EGRESS_RULE_PREFIX}{suffix}")),
        )
        .await
    }
}

/// Long-lived task translating host address events into whitelist edits.
/// Setup failure and edit failures are fatal: the host cannot safely run
/// with partial whitelist state.
pub struct InternalIpWhitelist {
    manager: Arc<DatapathManager>,
    watch: Arc<dyn AddrWatchPort>,
}

impl InternalIpWhitelist {
    pub fn new(manager: Arc<DatapathManager>, watch: Arc<dyn AddrWatchPort>) -> Self {
        Self { manager, watch }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut rx = match self.watch.watch() {
            Ok(rx) => rx,
            Err(e) => {
                self.manager
                    .report_fatal(DatapathError::Fatal(e.to_string()));
                return;
            }
        };
        loop {
            let event = tokio::select! {
                () = token.cancelled() => return,
                event = rx.recv() => event,
            };
            let Some(event) = event else { return };
            let result = match event {
                AddressEvent::Added { ip, ifindex } => {
                    info!(%ip, ifindex, "whitelisting host address");
                    self.manager.add_internal_ip(ip, ifindex).await
                }
                AddressEvent::Removed { ip, ifindex } => {
                    info!(%ip, ifindex, "removing host address whitelist");
                    self.manager.remove_internal_ip(ip, ifindex).await
                }
            };
            if let Err(e) = result {
                self.manager.report_fatal(DatapathError::Fatal(format!(
                    "internal whitelist update failed: {e}"
                )));
                return;
            }
        }
    }
}
