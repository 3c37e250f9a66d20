//! `SwitchPort` implementation over per-bridge OpenFlow sessions.
//!
//! Owns one session and one cookie allocator per bridge. Commands are
//! encoded and queued on the session without waiting for the switch; a
//! dropped session surfaces as `Unavailable` and the replay coordinator
//! repairs state after reconnect.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use domain::bridge::{BridgeChain, BridgeKind, ChainId, FlowEntry, FlowSpec};
use domain::cookie::{cookie, CookieAllocator, FLOW_ROUND_NUM_MASK};
use ports::secondary::switch_port::{BridgeEvent, SwitchError, SwitchPort};

use super::message::{
    encode_flow_add, encode_flow_delete, encode_flow_delete_by_cookie, encode_packet_out,
};
use super::session::{spawn_session, SessionHandle};

type BridgeKey = (ChainId, BridgeKind);

pub struct OvsSwitchAdapter {
    sessions: HashMap<BridgeKey, Arc<SessionHandle>>,
    allocators: HashMap<BridgeKey, CookieAllocator>,
    /// Local-bridge name per chain, for `ovs-ofctl` port tweaks.
    local_bridge_names: HashMap<ChainId, String>,
}

impl OvsSwitchAdapter {
    /// Spawn sessions for every bridge of every chain. Returns the
    /// adapter and the bridge event stream for the replay coordinator.
    pub fn connect(
        chains: &[BridgeChain],
        ovs_run_dir: &Path,
        event_capacity: usize,
        token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(event_capacity);
        let mut sessions = HashMap::new();
        let mut allocators = HashMap::new();
        let mut local_bridge_names = HashMap::new();

        for chain in chains {
            local_bridge_names.insert(
                chain.chain.clone(),
                chain.bridge_name(BridgeKind::Local),
            );
            for kind in chain.bridges() {
                let socket = ovs_run_dir.join(format!("{}.mgmt", chain.bridge_name(kind)));
                let handle = spawn_session(
                    chain.chain.clone(),
                    kind,
                    socket,
                    events_tx.clone(),
                    token.clone(),
                );
                sessions.insert((chain.chain.clone(), kind), handle);
                allocators.insert((chain.chain.clone(), kind), CookieAllocator::new(1));
            }
        }

        (
            Arc::new(Self {
                sessions,
                allocators,
                local_bridge_names,
            }),
            events_rx,
        )
    }

    fn session(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
    ) -> Result<&Arc<SessionHandle>, SwitchError> {
        let handle = self
            .sessions
            .get(&(chain.clone(), bridge))
            .ok_or_else(|| SwitchError::Rejected(format!("unmanaged bridge {chain}/{bridge}")))?;
        if !handle.is_connected() {
            return Err(SwitchError::Unavailable {
                chain: chain.clone(),
                bridge,
            });
        }
        Ok(handle)
    }

    fn send(
        handle: &SessionHandle,
        chain: &ChainId,
        bridge: BridgeKind,
        msg: Vec<u8>,
    ) -> Result<(), SwitchError> {
        handle.send(msg).map_err(|()| SwitchError::Unavailable {
            chain: chain.clone(),
            bridge,
        })
    }
}

impl SwitchPort for OvsSwitchAdapter {
    fn is_connected(&self) -> bool {
        self.sessions.values().all(|s| s.is_connected())
    }

    fn is_bridge_connected(&self, chain: &ChainId, bridge: BridgeKind) -> bool {
        self.sessions
            .get(&(chain.clone(), bridge))
            .is_some_and(|s| s.is_connected())
    }

    fn install_flow(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        spec: &FlowSpec,
    ) -> Result<FlowEntry, SwitchError> {
        let handle = self.session(chain, bridge)?;
        let allocator = self
            .allocators
            .get(&(chain.clone(), bridge))
            .expect("allocator exists for every session");
        let flow_id = allocator.allocate();
        let msg = encode_flow_add(handle.next_xid(), flow_id, spec);
        Self::send(handle, chain, bridge, msg)?;
        debug!(chain = %chain, bridge = %bridge, flow_id, table = spec.table, "installed flow");
        Ok(FlowEntry {
            chain: chain.clone(),
            bridge,
            table: spec.table,
            priority: spec.priority,
            flow_id,
        })
    }

    fn delete_flow(&self, entry: &FlowEntry) -> Result<(), SwitchError> {
        let handle = self.session(&entry.chain, entry.bridge)?;
        let msg = encode_flow_delete(handle.next_xid(), entry.table, entry.flow_id);
        Self::send(handle, &entry.chain, entry.bridge, msg)
    }

    fn delete_flows_by_round(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        round: u8,
    ) -> Result<(), SwitchError> {
        let handle = self.session(chain, bridge)?;
        let msg = encode_flow_delete_by_cookie(
            handle.next_xid(),
            cookie(round, 0) & FLOW_ROUND_NUM_MASK,
            FLOW_ROUND_NUM_MASK,
        );
        Self::send(handle, chain, bridge, msg)
    }

    fn set_cookie_round(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        round: u8,
    ) -> Result<(), SwitchError> {
        let _ = self.session(chain, bridge)?;
        self.allocators
            .get(&(chain.clone(), bridge))
            .expect("allocator exists for every session")
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
        let handle = self.session(chain, bridge)?;
        let msg = encode_packet_out(handle.next_xid(), port, payload);
        Self::send(handle, chain, bridge, msg)
    }

    fn set_port_no_flood(&self, chain: &ChainId, port: u32) -> Result<(), SwitchError> {
        let bridge_name = self
            .local_bridge_names
            .get(chain)
            .ok_or_else(|| SwitchError::Rejected(format!("unmanaged chain {chain}")))?;
        let (program, args) = no_flood_command(bridge_name, port);
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|e| SwitchError::Io(e.to_string()))?;
        if !output.status.success() {
            return Err(SwitchError::Rejected(format!(
                "ovs-ofctl mod-port failed for port {port} on {bridge_name}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// The `ovs-ofctl` invocation clearing the flood flag on a port.
fn no_flood_command(bridge: &str, port: u32) -> (&'static str, Vec<String>) {
    (
        "ovs-ofctl",
        vec![
            "mod-port".to_string(),
            bridge.to_string(),
            port.to_string(),
            "no-flood".to_string(),
        ],
    )
}
