use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum AddrWatchError {
    /// The initial address listing failed. Fatal: the host cannot safely
    /// run with partial whitelist state.
    #[error("address subscription setup failed: {0}")]
    SetupFailed(String),
}

/// A host IPv4 address appearing or disappearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEvent {
    Added { ip: Ipv4Addr, ifindex: u32 },
    Removed { ip: Ipv4Addr, ifindex: u32 },
}

/// Secondary port watching the host's non-loopback IPv4 addresses.
///
/// `watch` lists existing addresses (emitted as `Added`) and then streams
/// changes until the receiver is dropped.
pub trait AddrWatchPort: Send + Sync {
    fn watch(&self) -> Result<mpsc::Receiver<AddressEvent>, AddrWatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_watch_port_is_object_safe() {
        fn _check(port: &dyn AddrWatchPort) {
            let _ = port.watch();
        }
    }

    #[test]
    fn events_compare() {
        let ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            AddressEvent::Added { ip, ifindex: 2 },
            AddressEvent::Added { ip, ifindex: 2 }
        );
        assert_ne!(
            AddressEvent::Added { ip, ifindex: 2 },
            AddressEvent::Removed { ip, ifindex: 2 }
        );
    }
}
