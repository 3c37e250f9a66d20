//! Host IPv4 address watch over rtnetlink.
//!
//! `connect` performs the initial address listing; its failure means the
//! whitelist would start incomplete and must abort the agent. The watch
//! task then re-lists on an interval and diffs against the last snapshot;
//! transient poll errors are logged and retried.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::Handle;
use tokio::sync::mpsc;
use tracing::warn;

use ports::secondary::addr_watch_port::{AddrWatchError, AddrWatchPort, AddressEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

type AddrSet = BTreeSet<(Ipv4Addr, u32)>;

pub struct RtnetlinkAddrWatch {
    handle: Handle,
    initial: AddrSet,
    interval: Duration,
}

impl RtnetlinkAddrWatch {
    /// Open the netlink connection and take the initial address snapshot.
    pub async fn connect(interval: Duration) -> Result<Self, AddrWatchError> {
        let (connection, handle, _messages) =
            rtnetlink::new_connection().map_err(|e| AddrWatchError::SetupFailed(e.to_string()))?;
        tokio::spawn(connection);
        let initial = list_host_v4(&handle)
            .await
            .map_err(AddrWatchError::SetupFailed)?;
        Ok(Self {
            handle,
            initial,
            interval,
        })
    }
}

impl AddrWatchPort for RtnetlinkAddrWatch {
    fn watch(&self) -> Result<mpsc::Receiver<AddressEvent>, AddrWatchError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = self.handle.clone();
        let interval = self.interval;
        let initial = self.initial.clone();

        tokio::spawn(async move {
            let mut known = AddrSet::new();
            if drain_diff(&tx, &mut known, initial).await.is_err() {
                return;
            }
            loop {
                tokio::time::sleep(interval).await;
                match list_host_v4(&handle).await {
                    Ok(current) => {
                        if drain_diff(&tx, &mut known, current).await.is_err() {
                            return; // receiver gone
                        }
                    }
                    Err(e) => warn!(error = %e, "address poll failed"),
                }
            }
        });
        Ok(rx)
    }
}

/// Emit events for the delta between `known` and `current`, then replace
/// `known`.
async fn drain_diff(
    tx: &mpsc::Sender<AddressEvent>,
    known: &mut AddrSet,
    current: AddrSet,
) -> Result<(), ()> {
    for &(ip, ifindex) in current.difference(known) {
        tx.send(AddressEvent::Added { ip, ifindex })
            .await
            .map_err(|_| ())?;
    }
    for &(ip, ifindex) in known.difference(&current) {
        tx.send(AddressEvent::Removed { ip, ifindex })
            .await
            .map_err(|_| ())?;
    }
    *known = current;
    Ok(())
}

/// All non-loopback IPv4 addresses currently assigned on the host.
async fn list_host_v4(handle: &Handle) -> Result<AddrSet, String> {
    let mut out = AddrSet::new();
    let mut addresses = handle.address().get().execute();
    loop {
        let message = addresses.try_next().await.map_err(|e| e.to_string())?;
        let Some(message) = message else { break };
        let ifindex = message.header.index;
        for attribute in &message.attributes {
            if let AddressAttribute::Address(IpAddr::V4(ip)) = attribute {
                if !ip.is_loopback() {
                    out.insert((*ip, ifindex));
                }
            }
        }
    }
    Ok(out)
}
