//! Replay: reconstructing every flow from in-memory state under a fresh
//! restart round, on startup and on every switch reconnect.
//!
//! The round dance: load the persisted round, advance it, clear any
//! leftovers of the new round (a crash mid-install in a previous life),
//! repoint the cookie allocators, reinstall everything, and only after a
//! settle delay sweep the previous round and commit the new one. The
//! settle delay exists because flow installs are not linearizable against
//! stale-flow deletion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use domain::bridge::{bridge_init_flows, BridgeKind, ChainId};
use domain::common::error::DatapathError;
use domain::cookie::{RoundInfo, RESTART_ROUND_KEY};
use domain::rule::compile::compile_rule;
use domain::rule::entity::RuleEntry;
use ports::secondary::external_ids_port::ExternalIdsPort;
use ports::secondary::switch_port::BridgeEvent;

use crate::manager::{ChainState, DatapathManager};

/// Read the persisted round and advance it. A missing or malformed value
/// starts over at round 1; an unreachable store is fatal.
pub fn load_round(
    external_ids: &dyn ExternalIdsPort,
    bridge: &str,
) -> Result<RoundInfo, DatapathError> {
    let ids = external_ids
        .get_external_ids(bridge)
        .map_err(|e| DatapathError::Fatal(format!("failed to read round from {bridge}: {e}")))?;

    let Some(raw) = ids.get(RESTART_ROUND_KEY) else {
        info!(bridge, "no persisted restart round, starting at 1");
        return Ok(RoundInfo::initial());
    };
    match raw.parse::<u8>() {
        Ok(previous) => Ok(RoundInfo::next(previous)),
        Err(_) => {
            warn!(bridge, value = %raw, "malformed restart round, starting at 1");
            Ok(RoundInfo::initial())
        }
    }
}

/// Persist the committed round. Failure is fatal: determinism cannot be
/// recovered without it.
pub fn commit_round(
    external_ids: &dyn ExternalIdsPort,
    bridge: &str,
    round: u8,
) -> Result<(), DatapathError> {
    let mut ids = external_ids
        .get_external_ids(bridge)
        .map_err(|e| DatapathError::Fatal(format!("failed to read external_ids: {e}")))?;
    ids.insert(RESTART_ROUND_KEY.to_string(), round.to_string());
    external_ids
        .set_external_ids(bridge, ids)
        .map_err(|e| DatapathError::Fatal(format!("failed to persist round {round}: {e}")))
}

impl DatapathManager {
    /// Bring the datapath up: replay every chain, then whitelist the
    /// statically configured internal IPs.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), DatapathError> {
        self.wait_for_bridges_connected().await?;
        let chain_ids: Vec<ChainId> = self.chains.keys().cloned().collect();
        for chain_id in chain_ids {
            self.replay_chain(&chain_id).await?;
        }
        for (index, ip) in self.config.internal_ips.clone().into_iter().enumerate() {
            self.add_internal_ip(ip, index as u32)
                .await
                .map_err(|e| DatapathError::Fatal(format!("internal whitelist {ip}: {e}")))?;
        }
        Ok(())
    }

    /// Rebuild one chain's flows under a fresh round. Idempotent: two
    /// consecutive replays without intervening mutations produce the same
    /// flow set and the same final round.
    pub async fn replay_chain(self: &Arc<Self>, chain_id: &ChainId) -> Result<(), DatapathError> {
        let _guard = self.write_lock().await?;
        let result = self.replay_chain_locked(chain_id).await;
        match &result {
            Ok(()) => self.metrics.record_replay(&chain_id.0, "ok"),
            Err(_) => self.metrics.record_replay(&chain_id.0, "error"),
        }
        result
    }

    async fn replay_chain_locked(
        self: &Arc<Self>,
        chain_id: &ChainId,
    ) -> Result<(), DatapathError> {
        self.wait_for_bridges_connected().await?;
        let Some(state) = self.chains.get(chain_id) else {
            return Err(DatapathError::StoreInconsistency(format!(
                "unknown chain {chain_id}"
            )));
        };

        let local_bridge = state.chain.bridge_name(BridgeKind::Local);
        let round = load_round(&*self.external_ids, &local_bridge)?;
        info!(chain = %chain_id, ?round, "replaying chain");

        for kind in state.chain.bridges() {
            // Clear flows of the new round first: a crash in a previous
            // life may have left a partial install under it.
            self.switch
                .delete_flows_by_round(chain_id, kind, round.current)
                .map_err(DatapathError::from)?;
            self.switch
                .set_cookie_round(chain_id, kind, round.current)
                .map_err(DatapathError::from)?;
            for spec in bridge_init_flows(kind, &state.ports) {
                self.switch
                    .install_flow(chain_id, kind, &spec)
                    .map_err(DatapathError::from)?;
            }
        }

        self.replay_endpoint_flows(state)?;
        self.replay_policy_flows(chain_id, state)?;
        self.run_replay_hooks(state);
        self.replay_ip_pool_flows(chain_id)?;
        self.reset_no_flood(state)?;

        self.metrics.set_current_round(&chain_id.0, round.current);

        // Retire the previous generation only after in-flight installs of
        // the new one must have landed.
        let manager = Arc::clone(self);
        let chain_id = chain_id.clone();
        let settle = self.config.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            manager.finish_round(&chain_id, round);
        });

        Ok(())
    }

    fn replay_endpoint_flows(&self, state: &ChainState) -> Result<(), DatapathError> {
        for endpoint in self.endpoints.iter_by_bridge(&state.chain.base) {
            self.install_endpoint_flows(state, &endpoint)?;
        }
        Ok(())
    }

    fn replay_policy_flows(
        &self,
        chain_id: &ChainId,
        state: &ChainState,
    ) -> Result<(), DatapathError> {
        let entries: Vec<RuleEntry> = self.rules.lock().iter().cloned().collect();
        for mut entry in entries {
            let spec = compile_rule(
                &entry.rule,
                entry.direction,
                entry.tier,
                entry.mode,
                &state.ports,
            )?;
            let flow = self
                .switch
                .install_flow(chain_id, BridgeKind::Policy, &spec)
                .map_err(DatapathError::from)?;
            entry.flow_map.insert(chain_id.clone(), flow);
            self.rules.lock().upsert(entry);
        }
        // Sessions admitted by pre-replay flows may no longer have a rule.
        self.conntrack.request_flush();
        Ok(())
    }

    fn run_replay_hooks(&self, state: &ChainState) {
        if state.chain.nat_enabled {
            if let Some(hook) = &*self.proxy_replay.lock() {
                hook();
            }
        }
        if state.chain.overlay_enabled {
            if let Some(hook) = &*self.overlay_replay.lock() {
                hook();
            }
        }
    }

    fn replay_ip_pool_flows(&self, chain_id: &ChainId) -> Result<(), DatapathError> {
        let subnet_keys: Vec<String> = self.ip_pool_subnets.lock().keys().cloned().collect();
        for key in subnet_keys {
            let net: ipnetwork::Ipv4Network = key.parse().map_err(|_| {
                DatapathError::StoreInconsistency(format!("bad ip pool subnet {key}"))
            })?;
            let mut handles = self.drop_chain_handles(&self.ip_pool_subnets, &key, chain_id);
            for kind in [BridgeKind::Uplink, BridgeKind::Local] {
                if let Some(spec) = domain::bridge::ip_pool_subnet_flow(kind, net) {
                    handles.push(
                        self.switch
                            .install_flow(chain_id, kind, &spec)
                            .map_err(DatapathError::from)?,
                    );
                }
            }
            self.ip_pool_subnets.lock().insert(key, handles);
        }

        let gateway_keys: Vec<String> = self.ip_pool_gateways.lock().keys().cloned().collect();
        for key in gateway_keys {
            let net: ipnetwork::Ipv4Network = format!("{key}/32").parse().map_err(|_| {
                DatapathError::StoreInconsistency(format!("bad ip pool gateway {key}"))
            })?;
            let mut handles = self.drop_chain_handles(&self.ip_pool_gateways, &key, chain_id);
            if let Some(spec) = domain::bridge::ip_pool_gateway_flow(BridgeKind::Local, net) {
                handles.push(
                    self.switch
                        .install_flow(chain_id, BridgeKind::Local, &spec)
                        .map_err(DatapathError::from)?,
                );
            }
            self.ip_pool_gateways.lock().insert(key, handles);
        }
        Ok(())
    }

    /// Keep only the handles belonging to other chains; this chain's are
    /// being reinstalled.
    fn drop_chain_handles(
        &self,
        pool: &parking_lot::Mutex<HashMap<String, Vec<domain::bridge::FlowEntry>>>,
        key: &str,
        chain_id: &ChainId,
    ) -> Vec<domain::bridge::FlowEntry> {
        pool.lock()
            .get(key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|h| &h.chain != chain_id)
            .collect()
    }

    /// The settle sweep: delete the previous round's flows and commit the
    /// current round. Commit failure is fatal.
    fn finish_round(&self, chain_id: &ChainId, round: RoundInfo) {
        let Some(state) = self.chains.get(chain_id) else {
            return;
        };
        if let Some(previous) = round.previous {
            for kind in state.chain.bridges() {
                if let Err(e) = self.switch.delete_flows_by_round(chain_id, kind, previous) {
                    warn!(chain = %chain_id, bridge = %kind, error = %e,
                        "failed to sweep previous round");
                }
            }
        }
        let local_bridge = state.chain.bridge_name(BridgeKind::Local);
        if let Err(e) = commit_round(&*self.external_ids, &local_bridge, round.current) {
            self.report_fatal(e);
        }
    }
}

/// Long-lived task reacting to bridge session drops with a full chain
/// replay. Replay failure is unrecoverable.
pub struct ReplayCoordinator {
    manager: Arc<DatapathManager>,
    events: mpsc::Receiver<BridgeEvent>,
}

impl ReplayCoordinator {
    pub fn new(manager: Arc<DatapathManager>, events: mpsc::Receiver<BridgeEvent>) -> Self {
        Self { manager, events }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = token.cancelled() => return,
                event = self.events.recv() => event,
            };
            let Some(event) = event else { return };
            match event {
                BridgeEvent::Disconnected { chain, bridge } => {
                    info!(chain = %chain, bridge = %bridge, "bridge reconnect event");
                    if let Err(e) = self.manager.replay_chain(&chain).await {
                        self.manager.report_fatal(DatapathError::Fatal(format!(
                            "failed to replay chain {chain}: {e}"
                        )));
                        return;
                    }
                }
                BridgeEvent::Connected { .. } => {
                    // The connected latch is polled by waiters; nothing to do.
                }
                BridgeEvent::PacketIn { chain, bridge, payload } => {
                    // Monitor-mode flows punt here; the hit itself is the
                    // observable.
                    info!(chain = %chain, bridge = %bridge, len = payload.len(),
                        "policy packet-in");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use domain::bridge::FlowSpec;
    use domain::common::entity::{
        Direction, EnforcementMode, PolicyTier, RuleReference,
    };
    use domain::cookie::round_of;
    use ports::test_utils::MemoryExternalIds;

    use crate::testing::{harness_with_round, https_rule as rule, test_endpoint as endpoint};

    /// Flow identity without its cookie.
    fn flow_shape(f: &ports::test_utils::InstalledFlow) -> (u8, u16, FlowSpec) {
        (f.spec.table, f.spec.priority, f.spec.clone())
    }

    #[test]
    fn load_round_missing_key_starts_at_one() {
        let ids = MemoryExternalIds::new();
        let round = load_round(&ids, "ovsbr0").unwrap();
        assert_eq!(round, RoundInfo::initial());
    }

    #[test]
    fn load_round_malformed_starts_at_one() {
        let ids = MemoryExternalIds::with_entry("ovsbr0", RESTART_ROUND_KEY, "bogus");
        let round = load_round(&ids, "ovsbr0").unwrap();
        assert_eq!(round, RoundInfo::initial());
    }

    #[test]
    fn load_round_advances_persisted_value() {
        let ids = MemoryExternalIds::with_entry("ovsbr0", RESTART_ROUND_KEY, "7");
        let round = load_round(&ids, "ovsbr0").unwrap();
        assert_eq!(round.previous, Some(7));
        assert_eq!(round.current, 8);
    }

    #[test]
    fn commit_round_writes_decimal_text() {
        let ids = MemoryExternalIds::new();
        commit_round(&ids, "ovsbr0", 9).unwrap();
        assert_eq!(ids.get("ovsbr0", RESTART_ROUND_KEY).as_deref(), Some("9"));
    }

    #[test]
    fn commit_round_failure_is_fatal() {
        let ids = MemoryExternalIds::new();
        ids.fail_writes(true);
        let err = commit_round(&ids, "ovsbr0", 9).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_installs_under_new_round() {
        let h = harness_with_round(Some("3"));
        h.manager.replay_chain(&h.chain).await.unwrap();
        for cookie in h.switch.cookies_on(&h.chain, BridgeKind::Policy) {
            assert_eq!(round_of(cookie), 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settle_commits_round_and_sweeps_previous() {
        let h = harness_with_round(Some("3"));
        h.manager.replay_chain(&h.chain).await.unwrap();
        // Give the settle task time to run (paused clock auto-advances).
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.external_ids.get("ovsbr0", RESTART_ROUND_KEY).as_deref(),
            Some("4")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn round_wrap_fifteen_to_one() {
        // Scenario: persisted round 15 wraps to 1, never 0.
        let h = harness_with_round(Some("15"));
        h.manager.replay_chain(&h.chain).await.unwrap();

        let cookies = h.switch.cookies_on(&h.chain, BridgeKind::Policy);
        assert!(!cookies.is_empty());
        for cookie in cookies {
            assert_eq!(round_of(cookie), 1);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.external_ids.get("ovsbr0", RESTART_ROUND_KEY).as_deref(),
            Some("1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_restores_flow_table() {
        // Scenario: two rules and three endpoints; drop the session; on
        // reconnect the flow table matches except for the round nibble.
        let h = harness_with_round(Some("1"));
        h.manager.initialize().await.unwrap();

        h.manager
            .add_policy_rule(
                rule("r1", 443),
                RuleReference::from("ns1/p1"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap();
        h.manager
            .add_policy_rule(
                rule("r2", 80),
                RuleReference::from("ns1/p1"),
                Direction::Egress,
                PolicyTier::Tier1,
                EnforcementMode::Work,
            )
            .await
            .unwrap();
        for (name, port) in [("vnet0", 11), ("vnet1", 12), ("vnet2", 13)] {
            h.manager.add_local_endpoint(endpoint(name, port)).await.unwrap();
        }
        // Let the first settle sweep retire the pre-initialize state.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut before: Vec<_> = Vec::new();
        for kind in [BridgeKind::Local, BridgeKind::Policy, BridgeKind::Cls] {
            let mut flows: Vec<_> = h
                .switch
                .flows_on(&h.chain, kind)
                .iter()
                .map(flow_shape)
                .collect();
            flows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
            before.push((kind, flows));
        }
        let round_before = round_of(h.switch.cookies_on(&h.chain, BridgeKind::Policy)[0]);

        // Drop and restore the session, then replay.
        h.switch.set_connected(false);
        h.switch.set_connected(true);
        h.manager.replay_chain(&h.chain).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        for (kind, flows_before) in before {
            let mut flows_after: Vec<_> = h
                .switch
                .flows_on(&h.chain, kind)
                .iter()
                .map(flow_shape)
                .collect();
            flows_after.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
            assert_eq!(flows_before, flows_after, "flow table differs on {kind}");
        }
        let round_after = round_of(h.switch.cookies_on(&h.chain, BridgeKind::Policy)[0]);
        assert_eq!(round_after, (round_before % 15) + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_is_idempotent_before_commit() {
        // Two consecutive replays with no mutations and no intervening
        // commit produce the same flow set and the same round.
        let h = harness_with_round(Some("5"));
        h.manager
            .add_policy_rule(
                rule("r1", 443),
                RuleReference::from("ns1/p1"),
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
            )
            .await
            .unwrap();

        h.manager.replay_chain(&h.chain).await.unwrap();
        let mut first: Vec<_> = h
            .switch
            .flows_on(&h.chain, BridgeKind::Policy)
            .iter()
            .map(flow_shape)
            .collect();
        first.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        let first_round = round_of(h.switch.cookies_on(&h.chain, BridgeKind::Policy)[0]);

        h.manager.replay_chain(&h.chain).await.unwrap();
        let mut second: Vec<_> = h
            .switch
            .flows_on(&h.chain, BridgeKind::Policy)
            .iter()
            .map(flow_shape)
            .collect();
        second.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        let second_round = round_of(h.switch.cookies_on(&h.chain, BridgeKind::Policy)[0]);

        assert_eq!(first, second);
        assert_eq!(first_round, second_round);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_schedules_conntrack_flush() {
        let h = harness_with_round(None);
        h.manager.replay_chain(&h.chain).await.unwrap();
        assert!(h.scheduler.flush_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_resets_no_flood_on_local_patches() {
        let h = harness_with_round(None);
        h.manager.replay_chain(&h.chain).await.unwrap();
        let ports = h.switch.no_flood_ports();
        assert!(ports.contains(&(h.chain.clone(), 100)));
    }

    #[tokio::test(start_paused = true)]
    async fn commit_failure_reports_fatal() {
        let h = harness_with_round(Some("2"));
        let mut fatal_rx = h.manager.take_fatal_receiver().unwrap();
        h.external_ids.fail_writes(true);
        h.manager.replay_chain(&h.chain).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = fatal_rx.try_recv().expect("fatal error expected");
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_hooks_run_for_enabled_bridges() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let h = harness_with_round(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        h.manager
            .set_proxy_replay_hook(Box::new(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
            }));
        h.manager.replay_chain(&h.chain).await.unwrap();
        // Nat is disabled in this harness, so the proxy hook stays quiet.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_replays_on_disconnect_event() {
        let h = harness_with_round(Some("1"));
        let (tx, rx) = mpsc::channel(8);
        let coordinator = ReplayCoordinator::new(h.manager.clone(), rx);
        let token = CancellationToken::new();
        let handle = tokio::spawn(coordinator.run(token.clone()));

        tx.send(BridgeEvent::Disconnected {
            chain: h.chain.clone(),
            bridge: BridgeKind::Policy,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Replay happened: init flows exist under round 2.
        let cookies = h.switch.cookies_on(&h.chain, BridgeKind::Policy);
        assert!(!cookies.is_empty());
        assert!(cookies.iter().all(|c| round_of(*c) == 2));

        token.cancel();
        let _ = handle.await;
    }
}
