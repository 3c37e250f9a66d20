use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::{FlowAction, FlowMatch, FlowSpec, PatchPortMap};
use crate::bridge::{
    BridgeKind, ETH_TYPE_IPV4, LOCAL_ENDPOINT_TABLE, LOCAL_FORWARD_TABLE,
    NAT_TO_LOCAL_SUFFIX, NORMAL_MATCH_FLOW_PRIORITY, UPLINK_TO_CLS_SUFFIX,
};
use crate::common::entity::MacAddr;

/// An attached local interface.
///
/// Created when the collaborator observes a new interface in the switch's
/// interface table, mutated on IP learning and vnic reconfiguration,
/// destroyed on interface removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identity; at most one endpoint exists per interface UUID.
    pub interface_uuid: Uuid,
    pub interface_name: String,
    /// Base name of the bridge chain the interface is attached to.
    pub bridge_name: String,
    /// OpenFlow port number on the local bridge.
    pub port_no: u32,
    pub mac: MacAddr,
    pub ip_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    pub vlan_id: u16,
    /// VLAN trunk descriptor; wins over `vlan_id` when present.
    pub trunk: Option<String>,
    #[serde(skip)]
    pub ip_last_update: Option<SystemTime>,
}

impl Endpoint {
    /// The VLAN carried into flow matches; trunked endpoints match any VLAN.
    pub fn match_vlan(&self) -> Option<u16> {
        if self.trunk.is_some() || self.vlan_id == 0 {
            None
        } else {
            Some(self.vlan_id)
        }
    }

    /// Per-endpoint flows for one bridge of the chain.
    ///
    /// Local bridge: admission (in_port + source MAC) and L2 forwarding
    /// (destination MAC → port). Nat and overlay-uplink bridges steer
    /// endpoint-addressed traffic toward the local bridge.
    pub fn flows(
        &self,
        kind: BridgeKind,
        ports: &PatchPortMap,
        overlay_enabled: bool,
    ) -> Vec<FlowSpec> {
        match kind {
            BridgeKind::Local => vec![
                FlowSpec::new(LOCAL_ENDPOINT_TABLE, NORMAL_MATCH_FLOW_PRIORITY)
                    .matching(FlowMatch {
                        in_port: Some(self.port_no),
                        eth_src: Some(self.mac),
                        vlan_id: self.match_vlan(),
                        ..FlowMatch::default()
                    })
                    .doing(vec![FlowAction::GotoTable(LOCAL_FORWARD_TABLE)]),
                FlowSpec::new(LOCAL_FORWARD_TABLE, NORMAL_MATCH_FLOW_PRIORITY)
                    .matching(FlowMatch {
                        eth_dst: Some(self.mac),
                        ..FlowMatch::default()
                    })
                    .doing(vec![FlowAction::Output(self.port_no)]),
            ],
            BridgeKind::Nat => match ports.get(NAT_TO_LOCAL_SUFFIX) {
                Some(patch) => vec![
                    FlowSpec::new(0, NORMAL_MATCH_FLOW_PRIORITY)
                        .matching(FlowMatch {
                            eth_dst: Some(self.mac),
                            eth_type: Some(ETH_TYPE_IPV4),
                            ..FlowMatch::default()
                        })
                        .doing(vec![FlowAction::Output(patch)]),
                ],
                None => Vec::new(),
            },
            BridgeKind::Uplink if overlay_enabled => match ports.get(UPLINK_TO_CLS_SUFFIX) {
                Some(patch) => vec![
                    FlowSpec::new(0, NORMAL_MATCH_FLOW_PRIORITY)
                        .matching(FlowMatch {
                            eth_dst: Some(self.mac),
                            ..FlowMatch::default()
                        })
                        .doing(vec![FlowAction::Output(patch)]),
                ],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_endpoint(name: &str, port: u32) -> Endpoint {
        Endpoint {
            interface_uuid: Uuid::new_v4(),
            interface_name: name.to_string(),
            bridge_name: "ovsbr0".to_string(),
            port_no: port,
            mac: "aa:bb:cc:00:00:01".parse().unwrap(),
            ip_addr: None,
            ipv6_addr: None,
            vlan_id: 0,
            trunk: None,
            ip_last_update: None,
        }
    }

    #[test]
    fn local_flows_root_at_port() {
        let ep = make_endpoint("vnet0", 12);
        let flows = ep.flows(BridgeKind::Local, &PatchPortMap::new(), false);
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].matches.in_port, Some(12));
        assert_eq!(flows[1].actions, vec![FlowAction::Output(12)]);
    }

    #[test]
    fn trunked_endpoint_matches_any_vlan() {
        let mut ep = make_endpoint("vnet0", 3);
        ep.vlan_id = 100;
        assert_eq!(ep.match_vlan(), Some(100));
        ep.trunk = Some("0-4095".to_string());
        assert_eq!(ep.match_vlan(), None);
    }

    #[test]
    fn nat_flows_need_patch_port() {
        let ep = make_endpoint("vnet0", 3);
        assert!(ep.flows(BridgeKind::Nat, &PatchPortMap::new(), false).is_empty());

        let mut ports = PatchPortMap::new();
        ports.insert(NAT_TO_LOCAL_SUFFIX, 9);
        let flows = ep.flows(BridgeKind::Nat, &ports, false);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].actions, vec![FlowAction::Output(9)]);
    }

    #[test]
    fn uplink_flows_only_in_overlay_mode() {
        let ep = make_endpoint("vnet0", 3);
        let mut ports = PatchPortMap::new();
        ports.insert(UPLINK_TO_CLS_SUFFIX, 4);
        assert!(ep.flows(BridgeKind::Uplink, &ports, false).is_empty());
        assert_eq!(ep.flows(BridgeKind::Uplink, &ports, true).len(), 1);
    }

    #[test]
    fn policy_bridge_gets_no_endpoint_flows() {
        let ep = make_endpoint("vnet0", 3);
        assert!(ep
            .flows(BridgeKind::Policy, &PatchPortMap::new(), false)
            .is_empty());
    }
}
