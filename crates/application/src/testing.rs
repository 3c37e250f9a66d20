//! Shared harness for the application-level tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::bridge::{
    BridgeChain, ChainId, PatchPortMap, CLS_TO_POLICY_SUFFIX, CLS_TO_UPLINK_SUFFIX,
    LOCAL_TO_POLICY_SUFFIX, POLICY_TO_CLS_SUFFIX, POLICY_TO_LOCAL_SUFFIX,
};
use domain::common::entity::{Protocol, RuleAction, RuleId};
use domain::cookie::RESTART_ROUND_KEY;
use domain::endpoint::entity::Endpoint;
use domain::rule::entity::PolicyRule;
use ports::test_utils::{MemoryExternalIds, MockSwitch, NoopMetrics};

use crate::conntrack::ConntrackScheduler;
use crate::manager::{DatapathConfig, DatapathManager};

pub(crate) fn test_ports() -> PatchPortMap {
    let mut p = PatchPortMap::new();
    p.insert(LOCAL_TO_POLICY_SUFFIX, 100);
    p.insert(POLICY_TO_LOCAL_SUFFIX, 101);
    p.insert(POLICY_TO_CLS_SUFFIX, 102);
    p.insert(CLS_TO_POLICY_SUFFIX, 103);
    p.insert(CLS_TO_UPLINK_SUFFIX, 104);
    p
}

pub(crate) struct Harness {
    pub manager: Arc<DatapathManager>,
    pub switch: Arc<MockSwitch>,
    pub external_ids: Arc<MemoryExternalIds>,
    pub scheduler: ConntrackScheduler,
    pub chain: ChainId,
}

pub(crate) fn harness_with_round(persisted: Option<&str>) -> Harness {
    let chain = ChainId::from("vds-1");
    let config = DatapathConfig {
        chains: vec![BridgeChain {
            chain: chain.clone(),
            base: "ovsbr0".to_string(),
            nat_enabled: false,
            overlay_enabled: false,
        }],
        enable_ip_learning: true,
        local_gateway: Some("gw-nic".to_string()),
        settle_delay: Duration::from_millis(10),
        internal_ips: Vec::new(),
    };
    let switch = Arc::new(MockSwitch::new());
    let external_ids = Arc::new(match persisted {
        Some(round) => MemoryExternalIds::with_entry("ovsbr0", RESTART_ROUND_KEY, round),
        None => MemoryExternalIds::new(),
    });
    let scheduler = ConntrackScheduler::new(16);
    let manager = DatapathManager::new(
        config,
        HashMap::from([(chain.clone(), test_ports())]),
        switch.clone(),
        external_ids.clone(),
        scheduler.clone(),
        Arc::new(NoopMetrics),
    );
    Harness {
        manager,
        switch,
        external_ids,
        scheduler,
        chain,
    }
}

pub(crate) fn https_rule(id: &str, dst_port: u16) -> PolicyRule {
    PolicyRule {
        id: RuleId::from(id),
        priority: 10,
        src_ip: None,
        dst_ip: None,
        protocol: Protocol::Tcp,
        src_port: 0,
        src_port_mask: 0,
        dst_port,
        dst_port_mask: 0xffff,
        action: RuleAction::Allow,
    }
}

pub(crate) fn test_endpoint(name: &str, port: u32) -> Endpoint {
    Endpoint {
        interface_uuid: uuid::Uuid::new_v4(),
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
