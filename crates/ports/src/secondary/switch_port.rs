use domain::bridge::{BridgeKind, ChainId, FlowEntry, FlowSpec};
use domain::common::error::DatapathError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    /// The session to this bridge is not connected.
    #[error("switch session down for {chain}/{bridge}")]
    Unavailable { chain: ChainId, bridge: BridgeKind },

    /// The switch rejected the operation.
    #[error("switch rejected operation: {0}")]
    Rejected(String),

    #[error("switch I/O error: {0}")]
    Io(String),
}

impl From<SwitchError> for DatapathError {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Unavailable { .. } => Self::SwitchUnavailable(err.to_string()),
            SwitchError::Rejected(msg) => Self::FlowInstallFailed(msg),
            SwitchError::Io(msg) => Self::SwitchUnavailable(msg),
        }
    }
}

/// A bridge session transition or upcall, delivered to the replay
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected {
        chain: ChainId,
        bridge: BridgeKind,
    },
    Disconnected {
        chain: ChainId,
        bridge: BridgeKind,
    },
    /// A packet punted to the controller (monitor-mode logging, gateway
    /// ICMP).
    PacketIn {
        chain: ChainId,
        bridge: BridgeKind,
        payload: Vec<u8>,
    },
}

/// Secondary port for driving the software switch.
///
/// One session per bridge; all operations fail with `Unavailable` when the
/// session is down. The driver never retries; the replay coordinator owns
/// reconnection. Command submission is non-blocking (writes are queued on
/// the session), so implementations stay callable from async context.
pub trait SwitchPort: Send + Sync {
    /// Whether every bridge session of every chain is connected.
    fn is_connected(&self) -> bool;

    /// Whether one specific bridge session is connected.
    fn is_bridge_connected(&self, chain: &ChainId, bridge: BridgeKind) -> bool;

    /// Install a flow, allocating its cookie under the bridge's current
    /// round. Returns the handle needed for later deletion.
    fn install_flow(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        spec: &FlowSpec,
    ) -> Result<FlowEntry, SwitchError>;

    /// Delete one previously installed flow.
    fn delete_flow(&self, entry: &FlowEntry) -> Result<(), SwitchError>;

    /// Delete every flow on the bridge whose cookie carries `round` in its
    /// high nibble.
    fn delete_flows_by_round(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        round: u8,
    ) -> Result<(), SwitchError>;

    /// Point the bridge's cookie allocator at a new round. Sequence
    /// numbering restarts.
    fn set_cookie_round(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        round: u8,
    ) -> Result<(), SwitchError>;

    /// Emit a raw packet out of the given port.
    fn send_packet_out(
        &self,
        chain: &ChainId,
        bridge: BridgeKind,
        port: u32,
        payload: &[u8],
    ) -> Result<(), SwitchError>;

    /// Clear the flood flag on a local-bridge port.
    fn set_port_no_flood(&self, chain: &ChainId, port: u32) -> Result<(), SwitchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_port_is_object_safe() {
        fn _check(port: &dyn SwitchPort) {
            let _ = port.is_connected();
        }
    }

    #[test]
    fn unavailable_maps_to_switch_unavailable() {
        let err = SwitchError::Unavailable {
            chain: ChainId::from("vds-1"),
            bridge: BridgeKind::Policy,
        };
        assert!(matches!(
            DatapathError::from(err),
            DatapathError::SwitchUnavailable(_)
        ));
    }

    #[test]
    fn rejected_maps_to_flow_install_failed() {
        assert!(matches!(
            DatapathError::from(SwitchError::Rejected("bad table".into())),
            DatapathError::FlowInstallFailed(_)
        ));
    }
}
