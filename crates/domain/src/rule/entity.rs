use std::collections::{BTreeSet, HashMap};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::bridge::{ChainId, FlowEntry};
use crate::common::entity::{
    Direction, EnforcementMode, PolicyTier, Protocol, RuleAction, RuleId, RuleReference,
};
use crate::common::error::DatapathError;

/// The canonical match+action record. Immutable once admitted;
/// replacement is delete-then-add. Structural equality (`PartialEq`)
/// decides whether a re-add is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: RuleId,
    /// 1..=100, higher wins within a tier.
    pub priority: i32,
    pub src_ip: Option<Ipv4Network>,
    pub dst_ip: Option<Ipv4Network>,
    pub protocol: Protocol,
    pub src_port: u16,
    pub src_port_mask: u16,
    pub dst_port: u16,
    pub dst_port_mask: u16,
    pub action: RuleAction,
}

impl PolicyRule {
    pub fn validate(&self) -> Result<(), DatapathError> {
        self.id
            .validate()
            .map_err(|e| DatapathError::InvalidRule(e.to_string()))?;

        if !(1..=100).contains(&self.priority) {
            return Err(DatapathError::InvalidRule(format!(
                "priority {} out of range 1..=100",
                self.priority
            )));
        }

        // A port match without a mask bit set can never match anything.
        for (port, mask, which) in [
            (self.src_port, self.src_port_mask, "source"),
            (self.dst_port, self.dst_port_mask, "destination"),
        ] {
            if port != 0 && mask == 0 {
                return Err(DatapathError::InvalidRule(format!(
                    "{which} port {port} with zero mask"
                )));
            }
            if port & !mask != 0 {
                return Err(DatapathError::InvalidRule(format!(
                    "{which} port {port:#x} has bits outside mask {mask:#x}"
                )));
            }
        }

        if !self.protocol.has_ports()
            && (self.src_port != 0 || self.dst_port != 0)
        {
            return Err(DatapathError::InvalidRule(format!(
                "protocol {} cannot carry port matches",
                self.protocol.to_u8()
            )));
        }

        Ok(())
    }
}

/// The compiled occurrence of a rule in the store: the rule plus its
/// placement, its per-chain flow handles, and the policies referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub rule: PolicyRule,
    pub direction: Direction,
    pub tier: PolicyTier,
    pub mode: EnforcementMode,
    /// Exactly one entry per connected policy bridge.
    pub flow_map: HashMap<ChainId, FlowEntry>,
    /// Non-empty; removal of the last reference deletes the entry.
    pub references: BTreeSet<RuleReference>,
}

impl RuleEntry {
    pub fn new(
        rule: PolicyRule,
        direction: Direction,
        tier: PolicyTier,
        mode: EnforcementMode,
        owner: RuleReference,
    ) -> Self {
        Self {
            rule,
            direction,
            tier,
            mode,
            flow_map: HashMap::new(),
            references: BTreeSet::from([owner]),
        }
    }

    pub fn flow_ids(&self) -> Vec<u64> {
        self.flow_map.values().map(|f| f.flow_id).collect()
    }

    /// `namespace/name` keys of all referencing policies.
    pub fn policy_keys(&self) -> BTreeSet<String> {
        self.references
            .iter()
            .filter_map(RuleReference::policy_key)
            .collect()
    }

    /// Observability record for one of this entry's flow IDs.
    pub fn policy_info(&self, flow_id: u64) -> PolicyInfo {
        PolicyInfo {
            direction: self.direction,
            action: self.rule.action,
            mode: self.mode,
            flow_id,
            tier: self.tier,
            priority: self.rule.priority,
            items: self
                .references
                .iter()
                .map(|r| {
                    let (namespace, name, policy_type) = r.segments();
                    PolicyItem {
                        namespace,
                        name,
                        policy_type,
                    }
                })
                .collect(),
        }
    }
}

/// What observability reports for a flow hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub direction: Direction,
    pub action: RuleAction,
    pub mode: EnforcementMode,
    pub flow_id: u64,
    pub tier: PolicyTier,
    pub priority: i32,
    pub items: Vec<PolicyItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyItem {
    pub namespace: String,
    pub name: String,
    pub policy_type: String,
}

/// Allow-all ingress rule for a host-local address.
pub fn internal_ingress_rule(ip: std::net::Ipv4Addr) -> PolicyRule {
    PolicyRule {
        id: RuleId(format!("internal.ingress.{ip}")),
        priority: crate::bridge::INTERNAL_WHITELIST_PRIORITY,
        src_ip: None,
        dst_ip: Some(Ipv4Network::new(ip, 32).expect("/32 is always valid")),
        protocol: Protocol::Any,
        src_port: 0,
        src_port_mask: 0,
        dst_port: 0,
        dst_port_mask: 0,
        action: RuleAction::Allow,
    }
}

/// Allow-all egress rule for a host-local address.
pub fn internal_egress_rule(ip: std::net::Ipv4Addr) -> PolicyRule {
    PolicyRule {
        id: RuleId(format!("internal.egress.{ip}")),
        priority: crate::bridge::INTERNAL_WHITELIST_PRIORITY,
        src_ip: Some(Ipv4Network::new(ip, 32).expect("/32 is always valid")),
        dst_ip: None,
        protocol: Protocol::Any,
        src_port: 0,
        src_port_mask: 0,
        dst_port: 0,
        dst_port_mask: 0,
        action: RuleAction::Allow,
    }
}
