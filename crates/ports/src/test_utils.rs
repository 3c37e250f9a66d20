//! Shared fakes for exercising the datapath without a switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use domain::bridge::{BridgeKind, ChainId, FlowEntry, FlowSpec};
use domain::cookie::{round_of, CookieAllocator};
use domain::rule::entity::PolicyRule;

use crate::secondary::addr_watch_port::{AddrWatchError, AddrWatchPort, AddressEvent};
use crate::secondary::conntrack_port::{ConntrackError, ConntrackPort};
use crate::secondary::external_ids_port::{ExternalIdsError, ExternalIdsPort};
use crate::secondary::metrics_port::{ConntrackMetrics, FlowMetrics, ReplayMetrics};
use crate::secondary::switch_port::{SwitchError, SwitchPort};

// ── Metrics ─────────────────────────────────────────────────────────

/// No-op implementation of all metric traits.
pub struct NoopMetrics;

impl FlowMetrics for NoopMetrics {}
impl ReplayMetrics for NoopMetrics {}
impl ConntrackMetrics for NoopMetrics {}

// ── Mock switch ─────────────────────────────────────────────────────

/// One flow as the mock switch sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFlow {
    pub chain: ChainId,
    pub bridge: BridgeKind,
    pub spec: FlowSpec,
    pub cookie: u64,
}

type FlowKey = (ChainId, BridgeKind, u64);

/// In-memory switch: records installs, honors cookie rounds, and can be
/// flipped between connected and disconnected.
#[derive(Default)]
pub struct MockSwitch {
    connected: AtomicBool,
    allocators: Mutex<HashMap<(ChainId, BridgeKind), CookieAllocator>>,
    flows: Mutex<HashMap<FlowKey, InstalledFlow>>,
    install_count: AtomicUsize,
    packet_outs: Mutex<Vec<(ChainId, BridgeKind, u32, Vec<u8>)>>,
    no_flood_ports: Mutex<Vec<(ChainId, u32)>>,
}

impl MockSwitch {
    pub fn new() -> Self {
        let sw = Self::default();
        sw.connected.store(true, Ordering::SeqCst);
        sw
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Total number of install operations ever performed.
    pub fn install_count(&self) -> usize {
        self.install_count.load(Ordering::SeqCst)
    }

    /// Number of flows currently installed across all bridges.
    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    /// Snapshot of flows on one bridge.
    pub fn flows_on(&self, chain: &ChainId, bridge: BridgeKind) -> Vec<InstalledFlow> {
        self.flows
            .lock()
            .values()
            .filter(|f| &f.chain == chain && f.bridge == bridge)
            .cloned()
            .collect()
    }

    /// Cookies currently installed on one bridge.
    pub fn cookies_on(&self, chain: &ChainId, bridge: BridgeKind) -> Vec<u64> {
        self.flows_on(chain, bridge).iter().map(|f| f.cookie).collect()
    }

    pub fn contains_cookie(&self, cookie: u64) -> bool {
        self.flows.lock().values().any(|f| f.cookie == cookie)
    }

    pub fn packet_outs(&self) -> Vec<(ChainId, BridgeKind, u32, Vec<u8>)> {
        self.packet_outs.lock().clone()
    }

    pub fn no_flood_ports(&self) -> Vec<(ChainId, u32)> {
        self.no_flood_ports.lock().clone()
    }

    fn check_connected(&self, chain: &ChainId, bridge: BridgeKind) -> Result<(), SwitchError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchError::Unavailable {
                chain: chain.clone(),
                bridge,
            })
        }
    }
}

impl SwitchPort for MockSwitch {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_bridge_connected(&self, _chain: &ChainId, _bridge: BridgeKind) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn install_flow(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        spec: &FlowSpec,
    ) -> Result<FlowEntry, SwitchError> {
        self.check_connected(chain, bridge)?;
        let cookie = {
            let mut allocators = self.allocators.lock();
            allocators
                .entry((chain.clone(), bridge))
                .or_insert_with(|| CookieAllocator::new(1))
                .allocate()
        };
        self.install_count.fetch_add(1, Ordering::SeqCst);
        self.flows.lock().insert(
            (chain.clone(), bridge, cookie),
            InstalledFlow {
                chain: chain.clone(),
                bridge,
                spec: spec.clone(),
                cookie,
            },
        );
        Ok(FlowEntry {
            chain: chain.clone(),
            bridge,
            table: spec.table,
            priority: spec.priority,
            flow_id: cookie,
        })
    }

    fn delete_flow(&self, entry: &FlowEntry) -> Result<(), SwitchError> {
        self.check_connected(&entry.chain, entry.bridge)?;
        self.flows
            .lock()
            .remove(&(entry.chain.clone(), entry.bridge, entry.flow_id));
        Ok(())
    }

    fn delete_flows_by_round(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        round: u8,
    ) -> Result<(), SwitchError> {
        self.check_connected(chain, bridge)?;
        self.flows.lock().retain(|key, _| {
            let (c, b, cookie) = key;
            !(c == chain && *b == bridge && round_of(*cookie) == round)
        });
        Ok(())
    }

    fn set_cookie_round(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        round: u8,
    ) -> Result<(), SwitchError> {
        self.check_connected(chain, bridge)?;
        self.allocators
            .lock()
            .entry((chain.clone(), bridge))
            .or_insert_with(|| CookieAllocator::new(round))
            .set_round(round);
        Ok(())
    }

    fn send_packet_out(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        port: u32,
        payload: &[u8],
    ) -> Result<(), SwitchError> {
        self.check_connected(chain, bridge)?;
        self.packet_outs
            .lock()
            .push((chain.clone(), bridge, port, payload.to_vec()));
        Ok(())
    }

    fn set_port_no_flood(&self, chain: &ChainId, port: u32) -> Result<(), SwitchError> {
        self.check_connected(chain, BridgeKind::Local)?;
        self.no_flood_ports.lock().push((chain.clone(), port));
        Ok(())
    }
}

// ── Memory external_ids store ───────────────────────────────────────

/// In-memory `external_ids` store with an optional commit-failure switch.
#[derive(Default)]
pub struct MemoryExternalIds {
    ids: Mutex<HashMap<String, HashMap<String, String>>>,
    fail_writes: AtomicBool,
}

impl MemoryExternalIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(bridge: &str, key: &str, value: &str) -> Self {
        let store = Self::default();
        store.ids.lock().insert(
            bridge.to_string(),
            HashMap::from([(key.to_string(), value.to_string())]),
        );
        store
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, bridge: &str, key: &str) -> Option<String> {
        self.ids.lock().get(bridge)?.get(key).cloned()
    }
}

impl ExternalIdsPort for MemoryExternalIds {
    fn get_external_ids(&self, bridge: &str) -> Result<HashMap<String, String>, ExternalIdsError> {
        Ok(self.ids.lock().get(bridge).cloned().unwrap_or_default())
    }

    fn set_external_ids(
        &self,
        bridge: &str,
        ids: HashMap<String, String>,
    ) -> Result<(), ExternalIdsError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ExternalIdsError::Unreachable("write disabled".into()));
        }
        self.ids.lock().insert(bridge.to_string(), ids);
        Ok(())
    }
}

// ── Recording conntrack ─────────────────────────────────────────────

/// Conntrack port that records batches and flushes instead of touching
/// the kernel.
#[derive(Default)]
pub struct RecordingConntrack {
    batches: Mutex<Vec<Vec<PolicyRule>>>,
    flushes: AtomicUsize,
}

impl RecordingConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<PolicyRule>> {
        self.batches.lock().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl ConntrackPort for RecordingConntrack {
    fn flush_all(&self) -> Result<(), ConntrackError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_matching(&self, rules: &[PolicyRule]) -> Result<u64, ConntrackError> {
        self.batches.lock().push(rules.to_vec());
        Ok(rules.len() as u64)
    }
}

// ── Scripted address watch ──────────────────────────────────────────

/// Address watch that replays a fixed event script and then stays open so
/// tests can push more events.
pub struct ScriptedAddrWatch {
    script: Vec<AddressEvent>,
    tx: Mutex<Option<mpsc::Sender<AddressEvent>>>,
    fail_setup: bool,
}

impl ScriptedAddrWatch {
    pub fn new(script: Vec<AddressEvent>) -> Self {
        Self {
            script,
            tx: Mutex::new(None),
            fail_setup: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Vec::new(),
            tx: Mutex::new(None),
            fail_setup: true,
        }
    }

    /// Push an event after `watch` was called.
    pub async fn push(&self, event: AddressEvent) {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

impl AddrWatchPort for ScriptedAddrWatch {
    fn watch(&self) -> Result<mpsc::Receiver<AddressEvent>, AddrWatchError> {
        if self.fail_setup {
            return Err(AddrWatchError::SetupFailed("scripted failure".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        for event in &self.script {
            tx.try_send(*event)
                .map_err(|e| AddrWatchError::SetupFailed(e.to_string()))?;
        }
        *self.tx.lock() = Some(tx);
        Ok(rx)
    }
}
