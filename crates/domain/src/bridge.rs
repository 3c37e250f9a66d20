//! The bridge-chain model: bridge kinds, patch-port naming, numeric
//! constants of the flow plane, and the static flow skeletons installed
//! at bridge init.
//!
//! Fixed topology per managed switch:
//!
//! ```text
//! local ── (policy) ── cls ── uplink
//!    └─── (nat) ─────────────────┘     (when NAT/proxy enabled)
//! ```

use std::collections::HashMap;
use std::fmt;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::common::entity::MacAddr;

// ── Flow priorities ─────────────────────────────────────────────────

pub const HIGH_MATCH_FLOW_PRIORITY: u16 = 300;
pub const MID_MATCH_FLOW_PRIORITY: u16 = 200;
pub const NORMAL_MATCH_FLOW_PRIORITY: u16 = 100;
pub const DEFAULT_DROP_FLOW_PRIORITY: u16 = 70;
pub const GLOBAL_DEFAULT_POLICY_FLOW_PRIORITY: u16 = 40;
pub const DEFAULT_FLOW_MISS_PRIORITY: u16 = 10;
pub const FLOW_MATCH_OFFSET: u16 = 3;

// ── Tables ──────────────────────────────────────────────────────────

pub const LOCAL_INPUT_TABLE: u8 = 0;
pub const LOCAL_ENDPOINT_TABLE: u8 = 10;
pub const LOCAL_FORWARD_TABLE: u8 = 80;

pub const POLICY_INPUT_TABLE: u8 = 0;
/// Tier tables are the tier ranks themselves (50 / 100 / 130 / 150).
pub const POLICY_TIER_TABLES: [u8; 4] = [50, 100, 130, 150];
pub const POLICY_FORWARD_TABLE: u8 = 200;

// ── Patch-port suffixes ─────────────────────────────────────────────

pub const LOCAL_TO_POLICY_SUFFIX: &str = "local-to-policy";
pub const POLICY_TO_LOCAL_SUFFIX: &str = "policy-to-local";
pub const POLICY_TO_CLS_SUFFIX: &str = "policy-to-cls";
pub const CLS_TO_POLICY_SUFFIX: &str = "cls-to-policy";
pub const CLS_TO_UPLINK_SUFFIX: &str = "cls-to-uplink";
pub const UPLINK_TO_CLS_SUFFIX: &str = "uplink-to-cls";
pub const LOCAL_TO_NAT_SUFFIX: &str = "local-to-nat";
pub const NAT_TO_LOCAL_SUFFIX: &str = "nat-to-local";
pub const NAT_TO_UPLINK_SUFFIX: &str = "nat-to-uplink";
pub const UPLINK_TO_NAT_SUFFIX: &str = "uplink-to-nat";

/// Suffixes that identify patch ports on the local bridge; interfaces with
/// these names are never admitted as endpoints, and these ports get the
/// no-flood treatment after replay.
pub const LOCAL_PATCH_SUFFIXES: [&str; 2] = [LOCAL_TO_POLICY_SUFFIX, LOCAL_TO_NAT_SUFFIX];

// ── Internal whitelist owners ───────────────────────────────────────

pub const INTERNAL_INGRESS_RULE_PREFIX: &str = "/INTERNAL_INGRESS_POLICY/internal/ingress/-";
pub const INTERNAL_EGRESS_RULE_PREFIX: &str = "/INTERNAL_EGRESS_POLICY/internal/egress/-";
pub const INTERNAL_WHITELIST_PRIORITY: i32 = 100;

// ── Chain & bridge identity ─────────────────────────────────────────

/// Identifier of one managed bridge chain (one chain per managed switch).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The five bridge kinds of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    Local,
    Policy,
    Cls,
    Uplink,
    Nat,
}

impl BridgeKind {
    pub const ALL: [BridgeKind; 5] = [
        Self::Local,
        Self::Policy,
        Self::Cls,
        Self::Uplink,
        Self::Nat,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Policy => "policy",
            Self::Cls => "cls",
            Self::Uplink => "uplink",
            Self::Nat => "nat",
        }
    }

    /// OVS bridge name for this kind given the chain's base bridge name.
    /// The local bridge carries the base name itself.
    pub fn bridge_name(self, base: &str) -> String {
        match self {
            Self::Local => base.to_string(),
            other => format!("{base}-{}", other.keyword()),
        }
    }
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One managed bridge chain: its identity, base bridge name, and which
/// optional bridges are in play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeChain {
    pub chain: ChainId,
    pub base: String,
    pub nat_enabled: bool,
    pub overlay_enabled: bool,
}

impl BridgeChain {
    /// Bridges present in this chain, leaves first.
    pub fn bridges(&self) -> Vec<BridgeKind> {
        let mut out = vec![
            BridgeKind::Local,
            BridgeKind::Policy,
            BridgeKind::Cls,
            BridgeKind::Uplink,
        ];
        if self.nat_enabled {
            out.push(BridgeKind::Nat);
        }
        out
    }

    pub fn bridge_name(&self, kind: BridgeKind) -> String {
        kind.bridge_name(&self.base)
    }

    /// Name of the patch port with the given suffix, on whichever bridge
    /// owns that suffix.
    pub fn patch_port_name(&self, suffix: &str) -> String {
        let owner = match suffix {
            LOCAL_TO_POLICY_SUFFIX | LOCAL_TO_NAT_SUFFIX => BridgeKind::Local,
            POLICY_TO_LOCAL_SUFFIX | POLICY_TO_CLS_SUFFIX => BridgeKind::Policy,
            CLS_TO_POLICY_SUFFIX | CLS_TO_UPLINK_SUFFIX => BridgeKind::Cls,
            UPLINK_TO_CLS_SUFFIX | UPLINK_TO_NAT_SUFFIX => BridgeKind::Uplink,
            _ => BridgeKind::Nat,
        };
        format!("{}-{}", self.bridge_name(owner), suffix)
    }
}

/// The discovered `(suffix) → OpenFlow port number` map of one chain.
/// Missing entries are tolerated for bridges that are disabled.
#[derive(Debug, Clone, Default)]
pub struct PatchPortMap {
    ports: HashMap<&'static str, u32>,
}

impl PatchPortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, suffix: &'static str, port: u32) {
        self.ports.insert(suffix, port);
    }

    pub fn get(&self, suffix: &str) -> Option<u32> {
        self.ports.get(suffix).copied()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

// ── Flow model ──────────────────────────────────────────────────────

/// L4 port with mask; mask 0xffff is an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMatch {
    pub port: u16,
    pub mask: u16,
}

impl PortMatch {
    pub fn exact(port: u16) -> Self {
        Self { port, mask: 0xffff }
    }
}

/// The match half of a flow. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMatch {
    pub in_port: Option<u32>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub eth_type: Option<u16>,
    pub vlan_id: Option<u16>,
    pub ip_proto: Option<u8>,
    pub ipv4_src: Option<Ipv4Network>,
    pub ipv4_dst: Option<Ipv4Network>,
    pub l4_src: Option<PortMatch>,
    pub l4_dst: Option<PortMatch>,
}

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

/// The action half of a flow. An empty action list is an explicit drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Output(u32),
    GotoTable(u8),
    /// Punt to the controller (used for monitor-mode logging and
    /// gateway ICMP handling).
    Controller,
    /// OVS NORMAL L2 processing.
    Normal,
}

/// A flow ready to install: where it lives and what it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub table: u8,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub matches: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl FlowSpec {
    pub fn new(table: u8, priority: u16) -> Self {
        Self {
            table,
            priority,
            idle_timeout: 0,
            hard_timeout: 0,
            matches: FlowMatch::default(),
            actions: Vec::new(),
        }
    }

    pub fn matching(mut self, matches: FlowMatch) -> Self {
        self.matches = matches;
        self
    }

    pub fn doing(mut self, actions: Vec<FlowAction>) -> Self {
        self.actions = actions;
        self
    }
}

/// Handle to one installed flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub chain: ChainId,
    pub bridge: BridgeKind,
    pub table: u8,
    pub priority: u16,
    pub flow_id: u64,
}

// ── Static flow skeletons ───────────────────────────────────────────

/// The ACL skeleton installed on a bridge at init and on every replay.
pub fn bridge_init_flows(kind: BridgeKind, ports: &PatchPortMap) -> Vec<FlowSpec> {
    match kind {
        BridgeKind::Local => local_init_flows(ports),
        BridgeKind::Policy => policy_init_flows(ports),
        BridgeKind::Cls => cls_init_flows(ports),
        BridgeKind::Uplink | BridgeKind::Nat => vec![
            FlowSpec::new(0, DEFAULT_FLOW_MISS_PRIORITY).doing(vec![FlowAction::Normal]),
        ],
    }
}

fn local_init_flows(ports: &PatchPortMap) -> Vec<FlowSpec> {
    let mut flows = vec![
        FlowSpec::new(LOCAL_INPUT_TABLE, DEFAULT_FLOW_MISS_PRIORITY)
            .doing(vec![FlowAction::GotoTable(LOCAL_ENDPOINT_TABLE)]),
        // Traffic from ports no endpoint claims stays on the floor.
        FlowSpec::new(LOCAL_ENDPOINT_TABLE, DEFAULT_DROP_FLOW_PRIORITY).doing(vec![]),
    ];
    // ARP passes the admission table regardless of endpoint state.
    flows.push(
        FlowSpec::new(LOCAL_ENDPOINT_TABLE, NORMAL_MATCH_FLOW_PRIORITY + 1)
            .matching(FlowMatch {
                eth_type: Some(ETH_TYPE_ARP),
                ..FlowMatch::default()
            })
            .doing(vec![FlowAction::GotoTable(LOCAL_FORWARD_TABLE)]),
    );
    let forward_miss = match ports.get(LOCAL_TO_POLICY_SUFFIX) {
        Some(port) => vec![FlowAction::Output(port)],
        None => vec![FlowAction::Normal],
    };
    flows.push(FlowSpec::new(LOCAL_FORWARD_TABLE, DEFAULT_FLOW_MISS_PRIORITY).doing(forward_miss));
    flows
}

fn policy_init_flows(ports: &PatchPortMap) -> Vec<FlowSpec> {
    let mut flows = vec![FlowSpec::new(POLICY_INPUT_TABLE, DEFAULT_FLOW_MISS_PRIORITY)
        .doing(vec![FlowAction::GotoTable(POLICY_TIER_TABLES[0])])];

    // Each tier table falls through to the next; the last one falls through
    // to forwarding via the global default.
    for pair in POLICY_TIER_TABLES.windows(2) {
        flows.push(
            FlowSpec::new(pair[0], DEFAULT_FLOW_MISS_PRIORITY)
                .doing(vec![FlowAction::GotoTable(pair[1])]),
        );
    }
    let last = *POLICY_TIER_TABLES.last().expect("tier tables are fixed");
    flows.push(
        FlowSpec::new(last, GLOBAL_DEFAULT_POLICY_FLOW_PRIORITY)
            .doing(vec![FlowAction::GotoTable(POLICY_FORWARD_TABLE)]),
    );

    // Forwarding: traffic entering from one patch leaves by the other.
    if let (Some(to_local), Some(to_cls)) = (
        ports.get(POLICY_TO_LOCAL_SUFFIX),
        ports.get(POLICY_TO_CLS_SUFFIX),
    ) {
        flows.push(
            FlowSpec::new(POLICY_FORWARD_TABLE, NORMAL_MATCH_FLOW_PRIORITY)
                .matching(FlowMatch {
                    in_port: Some(to_local),
                    ..FlowMatch::default()
                })
                .doing(vec![FlowAction::Output(to_cls)]),
        );
        flows.push(
            FlowSpec::new(POLICY_FORWARD_TABLE, NORMAL_MATCH_FLOW_PRIORITY)
                .matching(FlowMatch {
                    in_port: Some(to_cls),
                    ..FlowMatch::default()
                })
                .doing(vec![FlowAction::Output(to_local)]),
        );
    }
    flows.push(FlowSpec::new(POLICY_FORWARD_TABLE, DEFAULT_FLOW_MISS_PRIORITY).doing(vec![]));
    flows
}

fn cls_init_flows(ports: &PatchPortMap) -> Vec<FlowSpec> {
    let mut flows = Vec::new();
    if let (Some(to_policy), Some(to_uplink)) = (
        ports.get(CLS_TO_POLICY_SUFFIX),
        ports.get(CLS_TO_UPLINK_SUFFIX),
    ) {
        flows.push(
            FlowSpec::new(0, NORMAL_MATCH_FLOW_PRIORITY)
                .matching(FlowMatch {
                    in_port: Some(to_policy),
                    ..FlowMatch::default()
                })
                .doing(vec![FlowAction::Output(to_uplink)]),
        );
        flows.push(
            FlowSpec::new(0, NORMAL_MATCH_FLOW_PRIORITY)
                .matching(FlowMatch {
                    in_port: Some(to_uplink),
                    ..FlowMatch::default()
                })
                .doing(vec![FlowAction::Output(to_policy)]),
        );
    }
    flows.push(FlowSpec::new(0, DEFAULT_FLOW_MISS_PRIORITY).doing(vec![]));
    flows
}

// ── IP-pool flows ───────────────────────────────────────────────────

/// Flow admitting traffic for an IP-pool subnet. Installed on the local
/// and uplink bridges.
pub fn ip_pool_subnet_flow(kind: BridgeKind, subnet: Ipv4Network) -> Option<FlowSpec> {
    match kind {
        BridgeKind::Local | BridgeKind::Uplink => Some(
            FlowSpec::new(0, HIGH_MATCH_FLOW_PRIORITY)
                .matching(FlowMatch {
                    eth_type: Some(ETH_TYPE_IPV4),
                    ipv4_dst: Some(subnet),
                    ..FlowMatch::default()
                })
                .doing(vec![FlowAction::Normal]),
        ),
        _ => None,
    }
}

/// Flow punting gateway-addressed ICMP to the controller. Local bridge only.
pub fn ip_pool_gateway_flow(kind: BridgeKind, gateway: Ipv4Network) -> Option<FlowSpec> {
    match kind {
        BridgeKind::Local => Some(
            FlowSpec::new(0, HIGH_MATCH_FLOW_PRIORITY)
                .matching(FlowMatch {
                    eth_type: Some(ETH_TYPE_IPV4),
                    ip_proto: Some(1),
                    ipv4_dst: Some(gateway),
                    ..FlowMatch::default()
                })
                .doing(vec![FlowAction::Controller]),
        ),
        _ => None,
    }
}
