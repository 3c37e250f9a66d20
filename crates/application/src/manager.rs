//! The datapath manager: owns the endpoint registry, the rule store, and
//! the replay lock, and turns policy/endpoint mutations into switch flows.
//!
//! Locking discipline: every mutator (endpoint CRUD, rule CRUD, replay)
//! holds the replay writer lock across its switch I/O so reconnects cannot
//! interleave; read-only queries take the reader side. Lock acquisition is
//! bounded; timeout expiry means an unrecoverable deadlock and is fatal.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use domain::bridge::{
    ip_pool_gateway_flow, ip_pool_subnet_flow, BridgeChain, BridgeKind, ChainId, FlowEntry,
    PatchPortMap, ETH_TYPE_ARP, LOCAL_PATCH_SUFFIXES,
};
use domain::common::entity::{
    Direction, EnforcementMode, MacAddr, PolicyTier, RuleId, RuleReference,
};
use domain::common::error::DatapathError;
use domain::endpoint::entity::Endpoint;
use domain::endpoint::registry::{EndpointRegistry, RegistryError};
use domain::rule::compile::compile_rule;
use domain::rule::entity::{PolicyInfo, PolicyRule, RuleEntry};
use domain::rule::store::RuleStore;
use ipnetwork::Ipv4Network;
use ports::secondary::external_ids_port::ExternalIdsPort;
use ports::secondary::metrics_port::DatapathMetrics;
use ports::secondary::switch_port::SwitchPort;

use crate::conntrack::ConntrackScheduler;

/// Acquisition bound for the replay lock; expiry signals a deadlock.
pub const REPLAY_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

const BRIDGE_CONNECT_ATTEMPTS: u32 = 40;
const BRIDGE_CONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Hook invoked during replay for flow families owned by collaborators.
pub type ReplayHook = Box<dyn Fn() + Send + Sync>;

/// Static manager configuration.
#[derive(Debug, Clone)]
pub struct DatapathConfig {
    pub chains: Vec<BridgeChain>,
    pub enable_ip_learning: bool,
    /// Name of the local gateway interface; never admitted as an endpoint.
    pub local_gateway: Option<String>,
    /// Delay between installing a new round and sweeping the previous one.
    pub settle_delay: Duration,
    /// Host addresses whitelisted at startup, before the watcher runs.
    pub internal_ips: Vec<Ipv4Addr>,
}

pub(crate) struct ChainState {
    pub(crate) chain: BridgeChain,
    pub(crate) ports: PatchPortMap,
}

/// Identity of an endpoint IP whose learning entry timed out.
#[derive(Debug, Clone)]
pub struct EndpointIp {
    pub bridge_name: String,
    pub of_port: u32,
    pub vlan_id: u16,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

pub struct DatapathManager {
    pub(crate) config: DatapathConfig,
    pub(crate) chains: HashMap<ChainId, ChainState>,
    pub(crate) endpoints: EndpointRegistry,
    pub(crate) endpoint_flows: Mutex<HashMap<Uuid, Vec<FlowEntry>>>,
    pub(crate) rules: Mutex<RuleStore>,
    pub(crate) replay_lock: RwLock<()>,
    pub(crate) switch: Arc<dyn SwitchPort>,
    pub(crate) external_ids: Arc<dyn ExternalIdsPort>,
    pub(crate) conntrack: ConntrackScheduler,
    pub(crate) metrics: Arc<dyn DatapathMetrics>,
    pub(crate) ip_pool_subnets: Mutex<HashMap<String, Vec<FlowEntry>>>,
    pub(crate) ip_pool_gateways: Mutex<HashMap<String, Vec<FlowEntry>>>,
    pub(crate) proxy_replay: Mutex<Option<ReplayHook>>,
    pub(crate) overlay_replay: Mutex<Option<ReplayHook>>,
    fatal_tx: mpsc::UnboundedSender<DatapathError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<DatapathError>>>,
}

impl DatapathManager {
    pub fn new(
        config: DatapathConfig,
        chain_ports: HashMap<ChainId, PatchPortMap>,
        switch: Arc<dyn SwitchPort>,
        external_ids: Arc<dyn ExternalIdsPort>,
        conntrack: ConntrackScheduler,
        metrics: Arc<dyn DatapathMetrics>,
    ) -> Arc<Self> {
        let mut chains = HashMap::new();
        for chain in &config.chains {
            let ports = chain_ports
                .get(&chain.chain)
                .cloned()
                .unwrap_or_default();
            chains.insert(
                chain.chain.clone(),
                ChainState {
                    chain: chain.clone(),
                    ports,
                },
            );
        }
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            chains,
            endpoints: EndpointRegistry::new(),
            endpoint_flows: Mutex::new(HashMap::new()),
            rules: Mutex::new(RuleStore::new()),
            replay_lock: RwLock::new(()),
            switch,
            external_ids,
            conntrack,
            metrics,
            ip_pool_subnets: Mutex::new(HashMap::new()),
            ip_pool_gateways: Mutex::new(HashMap::new()),
            proxy_replay: Mutex::new(None),
            overlay_replay: Mutex::new(None),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        })
    }

    /// Take the fatal-error channel. The agent supervisor listens on it
    /// and aborts the process when anything arrives.
    pub fn take_fatal_receiver(&self) -> Option<mpsc::UnboundedReceiver<DatapathError>> {
        self.fatal_rx.lock().take()
    }

    pub(crate) fn report_fatal(&self, err: DatapathError) {
        error!(error = %err, "fatal datapath error");
        let _ = self.fatal_tx.send(err);
    }

    // ── Lock discipline ─────────────────────────────────────────────

    pub(crate) async fn write_lock(&self) -> Result<RwLockWriteGuard<'_, ()>, DatapathError> {
        match tokio::time::timeout(REPLAY_LOCK_TIMEOUT, self.replay_lock.write()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let err = DatapathError::Fatal(format!(
                    "failed to acquire replay write lock within {REPLAY_LOCK_TIMEOUT:?}"
                ));
                self.report_fatal(DatapathError::Fatal(err.to_string()));
                Err(err)
            }
        }
    }

    pub(crate) async fn read_lock(&self) -> Result<RwLockReadGuard<'_, ()>, DatapathError> {
        match tokio::time::timeout(REPLAY_LOCK_TIMEOUT, self.replay_lock.read()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let err = DatapathError::Fatal(format!(
                    "failed to acquire replay read lock within {REPLAY_LOCK_TIMEOUT:?}"
                ));
                self.report_fatal(DatapathError::Fatal(err.to_string()));
                Err(err)
            }
        }
    }

    /// Block until every bridge session is up; fatal after the bound.
    pub(crate) async fn wait_for_bridges_connected(&self) -> Result<(), DatapathError> {
        for _ in 0..BRIDGE_CONNECT_ATTEMPTS {
            if self.switch.is_connected() {
                return Ok(());
            }
            tokio::time::sleep(BRIDGE_CONNECT_INTERVAL).await;
        }
        let err = DatapathError::Fatal("bridge chain failed to connect".into());
        self.report_fatal(DatapathError::Fatal(err.to_string()));
        Err(err)
    }

    // ── Endpoint feed ───────────────────────────────────────────────

    /// Interfaces that are part of the chain plumbing are never endpoints.
    fn skip_endpoint(&self, endpoint: &Endpoint) -> bool {
        for suffix in LOCAL_PATCH_SUFFIXES {
            if endpoint.interface_name.ends_with(suffix) {
                return true;
            }
        }
        if let Some(gw) = &self.config.local_gateway {
            if &endpoint.interface_name == gw {
                return true;
            }
        }
        // The bridge's own interface.
        self.chains
            .values()
            .any(|c| c.chain.base == endpoint.interface_name)
    }

    fn chain_for_bridge(&self, bridge_name: &str) -> Option<&ChainState> {
        self.chains.values().find(|c| c.chain.base == bridge_name)
    }

    pub async fn add_local_endpoint(&self, endpoint: Endpoint) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        self.wait_for_bridges_connected().await?;

        if self.skip_endpoint(&endpoint) {
            return Ok(());
        }
        let Some(state) = self.chain_for_bridge(&endpoint.bridge_name) else {
            return Ok(());
        };

        if self.endpoints.contains(&endpoint.interface_uuid) {
            info!(uuid = %endpoint.interface_uuid, "endpoint already added");
            return Ok(());
        }

        // Registry first: it is the source replay rebuilds from, so a
        // failed install below still converges on the next replay.
        match self.endpoints.add(endpoint.clone()) {
            Ok(()) => {}
            Err(RegistryError::Duplicate(uuid)) => {
                return Err(DatapathError::StoreInconsistency(format!(
                    "endpoint {uuid} already registered"
                )))
            }
            Err(RegistryError::NotFound(uuid)) => {
                return Err(DatapathError::StoreInconsistency(format!(
                    "endpoint {uuid} not found"
                )))
            }
        }
        self.install_endpoint_flows(state, &endpoint)?;
        Ok(())
    }

    pub async fn update_local_endpoint(
        &self,
        old: &Endpoint,
        mut new: Endpoint,
    ) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        self.wait_for_bridges_connected().await?;

        let Some(state) = self.chain_for_bridge(&new.bridge_name) else {
            return Ok(());
        };
        let Some(cached) = self.endpoints.get(&old.interface_uuid) else {
            return Err(DatapathError::StoreInconsistency(format!(
                "old endpoint {} not found",
                old.interface_uuid
            )));
        };

        if self.config.enable_ip_learning && new.ip_addr.is_none() {
            // Keep the learned address across vnic reconfiguration.
            new.ip_addr = cached.ip_addr;
        }

        self.endpoints.remove(&old.interface_uuid);
        if !state.chain.overlay_enabled {
            self.delete_endpoint_flows(&old.interface_uuid);
        } else {
            self.endpoint_flows.lock().remove(&old.interface_uuid);
        }

        if self.skip_endpoint(&new) {
            return Ok(());
        }
        if self.endpoints.contains(&new.interface_uuid) {
            return Err(DatapathError::StoreInconsistency(format!(
                "new endpoint {} already exists",
                new.interface_uuid
            )));
        }
        self.endpoints
            .add(new.clone())
            .map_err(|e| DatapathError::StoreInconsistency(e.to_string()))?;
        self.install_endpoint_flows(state, &new)?;
        Ok(())
    }

    pub async fn remove_local_endpoint(&self, endpoint: &Endpoint) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        self.wait_for_bridges_connected().await?;

        let Some(cached) = self.endpoints.get(&endpoint.interface_uuid) else {
            return Err(DatapathError::StoreInconsistency(format!(
                "endpoint {} ofport {} was not found",
                endpoint.interface_name, endpoint.port_no
            )));
        };
        if self.chain_for_bridge(&cached.bridge_name).is_none() {
            self.endpoints.remove(&endpoint.interface_uuid);
            return Ok(());
        }

        // Registry first, flows second: stay consistent with the
        // interface table even when the switch is unreachable.
        self.endpoints.remove(&endpoint.interface_uuid);
        self.delete_endpoint_flows(&endpoint.interface_uuid);
        Ok(())
    }

    pub(crate) fn install_endpoint_flows(
        &self,
        state: &ChainState,
        endpoint: &Endpoint,
    ) -> Result<(), DatapathError> {
        let mut handles = Vec::new();
        for kind in state.chain.bridges() {
            for spec in endpoint.flows(kind, &state.ports, state.chain.overlay_enabled) {
                let entry = self
                    .switch
                    .install_flow(&state.chain.chain, kind, &spec)
                    .map_err(DatapathError::from)?;
                self.metrics.record_flow_installed(kind.keyword());
                handles.push(entry);
            }
        }
        self.endpoint_flows
            .lock()
            .insert(endpoint.interface_uuid, handles);
        Ok(())
    }

    fn delete_endpoint_flows(&self, uuid: &Uuid) {
        let handles = self.endpoint_flows.lock().remove(uuid).unwrap_or_default();
        for entry in handles {
            if let Err(e) = self.switch.delete_flow(&entry) {
                warn!(error = %e, flow = entry.flow_id, "failed to delete endpoint flow");
            } else {
                self.metrics.record_flow_deleted(entry.bridge.keyword());
            }
        }
    }

    // ── Rule feed ───────────────────────────────────────────────────

    pub async fn add_policy_rule(
        &self,
        rule: PolicyRule,
        owner: RuleReference,
        direction: Direction,
        tier: PolicyTier,
        mode: EnforcementMode,
    ) -> Result<(), DatapathError> {
        rule.validate()?;
        let _guard = self.write_lock().await?;
        self.wait_for_bridges_connected().await?;

        let existing = self.rules.lock().get(&rule.id).cloned();
        if let Some(mut entry) = existing.clone() {
            if entry.rule == rule {
                // Same rule content: only the reference set grows.
                entry.references.insert(owner);
                info!(rule = %rule.id, "rule already exists, skip flow install");
                self.rules.lock().upsert(entry);
                return Ok(());
            }
        }

        // Install the replacement flows on every policy bridge first; the
        // store is only touched once the flow plane accepted them.
        let mut flow_map = HashMap::new();
        for (chain_id, state) in &self.chains {
            let spec = compile_rule(&rule, direction, tier, mode, &state.ports)?;
            let entry = self
                .switch
                .install_flow(chain_id, BridgeKind::Policy, &spec)
                .map_err(DatapathError::from)?;
            self.metrics
                .record_flow_installed(BridgeKind::Policy.keyword());
            flow_map.insert(chain_id.clone(), entry);
        }

        // A replaced rule's old flows go away before conntrack cleanup so
        // the cleanup corresponds to the new match.
        if let Some(old) = &existing {
            for entry in old.flow_map.values() {
                if let Err(e) = self.switch.delete_flow(entry) {
                    warn!(error = %e, rule = %rule.id, "failed to delete replaced flow");
                } else {
                    self.metrics.record_flow_deleted(entry.bridge.keyword());
                }
            }
        }

        self.conntrack.schedule(rule.clone());

        let mut entry = match existing {
            Some(mut e) => {
                e.references.insert(owner);
                e
            }
            None => RuleEntry::new(rule.clone(), direction, tier, mode, owner),
        };
        entry.rule = rule;
        entry.direction = direction;
        entry.tier = tier;
        entry.mode = mode;
        entry.flow_map = flow_map;

        let mut rules = self.rules.lock();
        rules.upsert(entry);
        self.metrics.set_rules_loaded(rules.len() as u64);
        Ok(())
    }

    pub async fn remove_policy_rule(
        &self,
        rule_id: &RuleId,
        owner: &RuleReference,
    ) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        self.wait_for_bridges_connected().await?;

        let Some(mut entry) = self.rules.lock().get(rule_id).cloned() else {
            error!(rule = %rule_id, "rule not found when deleting");
            return Ok(());
        };

        entry.references.remove(owner);
        if !entry.references.is_empty() {
            info!(rule = %rule_id, "rule still referenced, skip flow delete");
            self.rules.lock().upsert(entry);
            return Ok(());
        }

        for flow in entry.flow_map.values() {
            self.switch.delete_flow(flow).map_err(DatapathError::from)?;
            self.metrics.record_flow_deleted(flow.bridge.keyword());
        }

        self.conntrack.schedule(entry.rule.clone());

        let mut rules = self.rules.lock();
        rules.remove(rule_id)?;
        self.metrics.set_rules_loaded(rules.len() as u64);
        Ok(())
    }

    // ── Observability feed ──────────────────────────────────────────

    pub async fn get_policy_by_flow_id(
        &self,
        flow_ids: &[u64],
    ) -> Result<Vec<PolicyInfo>, DatapathError> {
        let _guard = self.read_lock().await?;
        let rules = self.rules.lock();
        Ok(flow_ids
            .iter()
            .filter(|id| **id != 0)
            .filter_map(|id| rules.get_by_flow_id(*id).map(|e| e.policy_info(*id)))
            .collect())
    }

    pub async fn get_rules_by_rule_ids(
        &self,
        rule_ids: &[RuleId],
    ) -> Result<Vec<RuleEntry>, DatapathError> {
        let _guard = self.read_lock().await?;
        let rules = self.rules.lock();
        Ok(rule_ids
            .iter()
            .filter_map(|id| rules.get(id).cloned())
            .collect())
    }

    pub async fn get_all_rules(&self) -> Result<Vec<RuleEntry>, DatapathError> {
        let _guard = self.read_lock().await?;
        Ok(self.rules.lock().iter().cloned().collect())
    }

    pub async fn get_chain_bridges(&self) -> Result<Vec<String>, DatapathError> {
        let _guard = self.read_lock().await?;
        Ok(self
            .chains
            .values()
            .map(|c| c.chain.base.clone())
            .collect())
    }

    // ── Replay hooks ────────────────────────────────────────────────

    pub fn set_proxy_replay_hook(&self, hook: ReplayHook) {
        *self.proxy_replay.lock() = Some(hook);
    }

    pub fn set_overlay_replay_hook(&self, hook: ReplayHook) {
        *self.overlay_replay.lock() = Some(hook);
    }

    // ── IP pool ─────────────────────────────────────────────────────

    pub async fn add_ip_pool_subnet(&self, subnet: Ipv4Network) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        let key = subnet.to_string();
        if self.ip_pool_subnets.lock().contains_key(&key) {
            return Ok(());
        }
        let mut handles = Vec::new();
        for chain_id in self.chains.keys() {
            for kind in [BridgeKind::Uplink, BridgeKind::Local] {
                if let Some(spec) = ip_pool_subnet_flow(kind, subnet) {
                    let entry = self
                        .switch
                        .install_flow(chain_id, kind, &spec)
                        .map_err(DatapathError::from)?;
                    handles.push(entry);
                }
            }
        }
        self.ip_pool_subnets.lock().insert(key, handles);
        Ok(())
    }

    pub async fn del_ip_pool_subnet(&self, subnet: Ipv4Network) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        let Some(handles) = self.ip_pool_subnets.lock().remove(&subnet.to_string()) else {
            return Ok(());
        };
        for entry in handles {
            self.switch.delete_flow(&entry).map_err(DatapathError::from)?;
        }
        Ok(())
    }

    pub async fn add_ip_pool_gateway(&self, gateway: Ipv4Addr) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        let key = gateway.to_string();
        if self.ip_pool_gateways.lock().contains_key(&key) {
            return Ok(());
        }
        let net = Ipv4Network::new(gateway, 32).expect("/32 is always valid");
        let mut handles = Vec::new();
        for chain_id in self.chains.keys() {
            if let Some(spec) = ip_pool_gateway_flow(BridgeKind::Local, net) {
                let entry = self
                    .switch
                    .install_flow(chain_id, BridgeKind::Local, &spec)
                    .map_err(DatapathError::from)?;
                handles.push(entry);
            }
        }
        self.ip_pool_gateways.lock().insert(key, handles);
        Ok(())
    }

    pub async fn del_ip_pool_gateway(&self, gateway: Ipv4Addr) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        let Some(handles) = self.ip_pool_gateways.lock().remove(&gateway.to_string()) else {
            return Ok(());
        };
        for entry in handles {
            self.switch.delete_flow(&entry).map_err(DatapathError::from)?;
        }
        Ok(())
    }

    // ── Endpoint IP probing ─────────────────────────────────────────

    /// Re-probe a quiet endpoint's IP with an ARP request packet-out on
    /// the local bridge.
    pub async fn handle_endpoint_ip_timeout(
        &self,
        endpoint_ip: &EndpointIp,
    ) -> Result<(), DatapathError> {
        let _guard = self.read_lock().await?;
        let Some(state) = self.chain_for_bridge(&endpoint_ip.bridge_name) else {
            return Err(DatapathError::StoreInconsistency(format!(
                "no managed chain for bridge {}",
                endpoint_ip.bridge_name
            )));
        };
        let payload =
            build_arp_request(endpoint_ip.mac, endpoint_ip.ip, endpoint_ip.vlan_id);
        self.switch
            .send_packet_out(
                &state.chain.chain,
                BridgeKind::Local,
                endpoint_ip.of_port,
                &payload,
            )
            .map_err(DatapathError::from)
    }

    // ── No-flood reset ──────────────────────────────────────────────

    pub(crate) fn reset_no_flood(&self, state: &ChainState) -> Result<(), DatapathError> {
        for suffix in LOCAL_PATCH_SUFFIXES {
            let Some(port) = state.ports.get(suffix) else {
                info!(port = suffix, "port in local bridge doesn't exist, skip no-flood");
                continue;
            };
            self.switch
                .set_port_no_flood(&state.chain.chain, port)
                .map_err(DatapathError::from)?;
        }
        Ok(())
    }
}

/// Broadcast ARP request probing `target_ip`, tagged with `vlan` when
/// nonzero.
pub(crate) fn build_arp_request(src_mac: MacAddr, target_ip: Ipv4Addr, vlan: u16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(46);
    pkt.extend_from_slice(&MacAddr::BROADCAST.octets());
    pkt.extend_from_slice(&src_mac.octets());
    if vlan != 0 {
        pkt.extend_from_slice(&0x8100u16.to_be_bytes());
        pkt.extend_from_slice(&(vlan & 0x0fff).to_be_bytes());
    }
    pkt.extend_from_slice(&ETH_TYPE_ARP.to_be_bytes());
    pkt.extend_from_slice(&1u16.to_be_bytes()); // htype: ethernet
    pkt.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype: ipv4
    pkt.push(6); // hlen
    pkt.push(4); // plen
    pkt.extend_from_slice(&1u16.to_be_bytes()); // oper: request
    pkt.extend_from_slice(&src_mac.octets());
    pkt.extend_from_slice(&[0, 0, 0, 0]); // spa: unknown
    pkt.extend_from_slice(&[0; 6]); // tha
    pkt.extend_from_slice(&target_ip.octets());
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::bridge::{FlowAction, POLICY_FORWARD_TABLE};
    use domain::common::entity::RuleAction;
    use domain::cookie::round_of;

    use crate::testing::{harness_with_round, https_rule, test_endpoint};

    fn owner(name: &str) -> RuleReference {
        RuleReference::from(name)
    }

    // ── Scenario: basic add/remove ──────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn basic_add_and_remove() {
        let h = harness_with_round(None);
        h.manager
            .add_policy_rule(
                https_rule("r1", 443),
                owner("o/p"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap();

        let flows = h.switch.flows_on(&h.chain, BridgeKind::Policy);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].spec.table, 100);
        assert_eq!(flows[0].spec.priority, 213); // 200 + 3 + 10
        assert_eq!(round_of(flows[0].cookie), 1);
        let cookie = flows[0].cookie;

        h.manager
            .remove_policy_rule(&RuleId::from("r1"), &owner("o/p"))
            .await
            .unwrap();
        assert!(!h.switch.contains_cookie(cookie));
        assert!(h.manager.get_all_rules().await.unwrap().is_empty());
    }

    // ── Scenario: idempotent add ────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn idempotent_add_installs_once() {
        let h = harness_with_round(None);
        for _ in 0..2 {
            h.manager
                .add_policy_rule(
                    https_rule("r1", 443),
                    owner("o1/p"),
                    Direction::Ingress,
                    PolicyTier::Tier2,
                    EnforcementMode::Work,
                )
                .await
                .unwrap();
        }
        assert_eq!(h.switch.install_count(), 1);
        let rules = h.manager.get_all_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].references.len(), 1);
    }

    // ── Scenario: shared rule ───────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn shared_rule_lives_until_last_owner() {
        let h = harness_with_round(None);
        for o in ["o1/p", "o2/p"] {
            h.manager
                .add_policy_rule(
                    https_rule("r1", 443),
                    owner(o),
                    Direction::Ingress,
                    PolicyTier::Tier2,
                    EnforcementMode::Work,
                )
                .await
                .unwrap();
        }
        assert_eq!(h.switch.install_count(), 1);
        assert_eq!(
            h.manager.get_all_rules().await.unwrap()[0].references.len(),
            2
        );

        h.manager
            .remove_policy_rule(&RuleId::from("r1"), &owner("o1/p"))
            .await
            .unwrap();
        assert_eq!(h.switch.flows_on(&h.chain, BridgeKind::Policy).len(), 1);

        h.manager
            .remove_policy_rule(&RuleId::from("r1"), &owner("o2/p"))
            .await
            .unwrap();
        assert!(h.switch.flows_on(&h.chain, BridgeKind::Policy).is_empty());
        assert!(h.manager.get_all_rules().await.unwrap().is_empty());
    }

    // ── Store/flow agreement ────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn every_entry_has_one_flow_per_policy_bridge() {
        let h = harness_with_round(None);
        for (id, port) in [("r1", 443), ("r2", 80), ("r3", 22)] {
            h.manager
                .add_policy_rule(
                    https_rule(id, port),
                    owner("ns/p"),
                    Direction::Ingress,
                    PolicyTier::Tier2,
                    EnforcementMode::Work,
                )
                .await
                .unwrap();
        }
        for entry in h.manager.get_all_rules().await.unwrap() {
            assert_eq!(entry.flow_map.len(), 1);
            let flow = &entry.flow_map[&h.chain];
            assert!(h.switch.contains_cookie(flow.flow_id));
            assert_eq!(round_of(flow.flow_id), 1);
        }
    }

    // ── Rule replacement ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn changed_rule_replaces_flows() {
        let h = harness_with_round(None);
        h.manager
            .add_policy_rule(
                https_rule("r1", 443),
                owner("o/p"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap();
        let old_cookie = h.switch.cookies_on(&h.chain, BridgeKind::Policy)[0];

        // Same ID, different match: delete-then-add semantics.
        h.manager
            .add_policy_rule(
                https_rule("r1", 8443),
                owner("o/p"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap();

        assert!(!h.switch.contains_cookie(old_cookie));
        let flows = h.switch.flows_on(&h.chain, BridgeKind::Policy);
        assert_eq!(flows.len(), 1);
        assert_eq!(
            flows[0].spec.matches.l4_dst,
            Some(domain::bridge::PortMatch::exact(8443))
        );
        // Both edits scheduled conntrack cleanup.
        assert_eq!(h.scheduler.queued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_rule_leaves_no_state() {
        let h = harness_with_round(None);
        let mut bad = https_rule("r1", 443);
        bad.priority = 0;
        let err = h
            .manager
            .add_policy_rule(
                bad,
                owner("o/p"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatapathError::InvalidRule(_)));
        assert_eq!(h.switch.flow_count(), 0);
        assert!(h.manager.get_all_rules().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_unknown_rule_is_noop() {
        let h = harness_with_round(None);
        h.manager
            .remove_policy_rule(&RuleId::from("ghost"), &owner("o/p"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_mode_installs_log_and_allow() {
        let h = harness_with_round(None);
        let mut deny = https_rule("r1", 443);
        deny.action = RuleAction::Deny;
        h.manager
            .add_policy_rule(
                deny,
                owner("o/p"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Monitor,
            )
            .await
            .unwrap();

        let flows = h.switch.flows_on(&h.chain, BridgeKind::Policy);
        assert_eq!(
            flows[0].spec.actions,
            vec![
                FlowAction::Controller,
                FlowAction::GotoTable(POLICY_FORWARD_TABLE)
            ]
        );
        // Observability still reports the declared action.
        let infos = h
            .manager
            .get_policy_by_flow_id(&[flows[0].cookie])
            .await
            .unwrap();
        assert_eq!(infos[0].action, RuleAction::Deny);
    }

    // ── Endpoint feed ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn add_endpoint_installs_local_flows() {
        let h = harness_with_round(None);
        let ep = test_endpoint("vnet0", 12);
        h.manager.add_local_endpoint(ep.clone()).await.unwrap();

        let flows = h.switch.flows_on(&h.chain, BridgeKind::Local);
        assert_eq!(flows.len(), 2);
        assert!(flows
            .iter()
            .any(|f| f.spec.matches.in_port == Some(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_endpoint_is_noop() {
        let h = harness_with_round(None);
        let ep = test_endpoint("vnet0", 12);
        h.manager.add_local_endpoint(ep.clone()).await.unwrap();
        h.manager.add_local_endpoint(ep).await.unwrap();
        assert_eq!(h.switch.flows_on(&h.chain, BridgeKind::Local).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn patch_port_and_gateway_interfaces_skipped() {
        let h = harness_with_round(None);
        h.manager
            .add_local_endpoint(test_endpoint("ovsbr0-local-to-policy", 1))
            .await
            .unwrap();
        h.manager
            .add_local_endpoint(test_endpoint("gw-nic", 2))
            .await
            .unwrap();
        h.manager
            .add_local_endpoint(test_endpoint("ovsbr0", 3))
            .await
            .unwrap();
        assert_eq!(h.switch.flow_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_endpoint_deletes_flows() {
        let h = harness_with_round(None);
        let ep = test_endpoint("vnet0", 12);
        h.manager.add_local_endpoint(ep.clone()).await.unwrap();
        h.manager.remove_local_endpoint(&ep).await.unwrap();
        assert_eq!(h.switch.flow_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_unknown_endpoint_is_inconsistency() {
        let h = harness_with_round(None);
        let err = h
            .manager
            .remove_local_endpoint(&test_endpoint("vnet0", 12))
            .await
            .unwrap_err();
        assert!(matches!(err, DatapathError::StoreInconsistency(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn update_preserves_learned_ip() {
        let h = harness_with_round(None);
        let mut old = test_endpoint("vnet0", 12);
        old.ip_addr = Some("10.0.0.9".parse().unwrap());
        h.manager.add_local_endpoint(old.clone()).await.unwrap();

        let mut new = test_endpoint("vnet0", 13);
        new.interface_uuid = old.interface_uuid;
        new.ip_addr = None;
        h.manager
            .update_local_endpoint(&old, new.clone())
            .await
            .unwrap();

        let cached = h.manager.endpoints.get(&new.interface_uuid).unwrap();
        assert_eq!(cached.ip_addr, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(cached.port_no, 13);
        // Old flows replaced by new ones.
        let flows = h.switch.flows_on(&h.chain, BridgeKind::Local);
        assert!(flows.iter().any(|f| f.spec.matches.in_port == Some(13)));
        assert!(!flows.iter().any(|f| f.spec.matches.in_port == Some(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn update_missing_old_endpoint_fails() {
        let h = harness_with_round(None);
        let old = test_endpoint("vnet0", 12);
        let err = h
            .manager
            .update_local_endpoint(&old, test_endpoint("vnet0", 13))
            .await
            .unwrap_err();
        assert!(matches!(err, DatapathError::StoreInconsistency(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_switch_fails_closed() {
        let h = harness_with_round(None);
        h.switch.set_connected(false);
        // The 40x1s connect wait elapses under the paused clock, then the
        // operation reports fatal.
        let err = h
            .manager
            .add_policy_rule(
                https_rule("r1", 443),
                owner("o/p"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    // ── Observability ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn flow_id_lookup_reports_owners() {
        let h = harness_with_round(None);
        h.manager
            .add_policy_rule(
                https_rule("r1", 443),
                owner("ns1/p1/SecurityPolicy"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap();
        let cookie = h.switch.cookies_on(&h.chain, BridgeKind::Policy)[0];

        let infos = h
            .manager
            .get_policy_by_flow_id(&[0, cookie, 0xdead])
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].flow_id, cookie);
        assert_eq!(infos[0].items[0].namespace, "ns1");
        assert_eq!(infos[0].items[0].name, "p1");
        assert_eq!(infos[0].priority, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn chain_bridges_listed() {
        let h = harness_with_round(None);
        assert_eq!(
            h.manager.get_chain_bridges().await.unwrap(),
            vec!["ovsbr0".to_string()]
        );
    }

    // ── IP pool ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ip_pool_subnet_roundtrip() {
        let h = harness_with_round(None);
        let subnet: Ipv4Network = "10.100.0.0/24".parse().unwrap();
        h.manager.add_ip_pool_subnet(subnet).await.unwrap();
        // Local + uplink.
        assert_eq!(h.switch.flow_count(), 2);
        // Idempotent.
        h.manager.add_ip_pool_subnet(subnet).await.unwrap();
        assert_eq!(h.switch.flow_count(), 2);

        h.manager.del_ip_pool_subnet(subnet).await.unwrap();
        assert_eq!(h.switch.flow_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ip_pool_gateway_roundtrip() {
        let h = harness_with_round(None);
        let gw: Ipv4Addr = "10.100.0.1".parse().unwrap();
        h.manager.add_ip_pool_gateway(gw).await.unwrap();
        assert_eq!(h.switch.flow_count(), 1);
        h.manager.del_ip_pool_gateway(gw).await.unwrap();
        assert_eq!(h.switch.flow_count(), 0);
    }

    // ── ARP probe ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ip_timeout_sends_arp_probe() {
        let h = harness_with_round(None);
        let probe = EndpointIp {
            bridge_name: "ovsbr0".to_string(),
            of_port: 7,
            vlan_id: 0,
            mac: "aa:bb:cc:00:00:01".parse().unwrap(),
            ip: "10.0.0.9".parse().unwrap(),
        };
        h.manager.handle_endpoint_ip_timeout(&probe).await.unwrap();

        let outs = h.switch.packet_outs();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].2, 7);
        // Broadcast destination, ARP ethertype.
        assert_eq!(&outs[0].3[0..6], &[0xff; 6]);
        assert_eq!(&outs[0].3[12..14], &ETH_TYPE_ARP.to_be_bytes());
    }

    #[test]
    fn arp_request_layout() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        let pkt = build_arp_request(mac, "10.0.0.1".parse().unwrap(), 0);
        assert_eq!(pkt.len(), 42);
        assert_eq!(&pkt[6..12], &mac.octets());
        // Target IP is the last four bytes.
        assert_eq!(&pkt[38..42], &[10, 0, 0, 1]);

        let tagged = build_arp_request(mac, "10.0.0.1".parse().unwrap(), 100);
        assert_eq!(tagged.len(), 46);
        assert_eq!(&tagged[12..14], &[0x81, 0x00]);
    }
}
