//! Wiring: adapters → datapath manager → background workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adapters::addrwatch::RtnetlinkAddrWatch;
use adapters::conntrack::ConntrackCli;
use adapters::openflow::OvsSwitchAdapter;
use adapters::ovsdb::OvsdbClient;
use application::conntrack::{ConntrackScheduler, ConntrackWorker};
use application::internal_ip::InternalIpWhitelist;
use application::manager::{DatapathConfig, DatapathManager};
use application::replay::ReplayCoordinator;
use domain::bridge::{
    BridgeChain, ChainId, PatchPortMap, CLS_TO_POLICY_SUFFIX, CLS_TO_UPLINK_SUFFIX,
    LOCAL_TO_NAT_SUFFIX, LOCAL_TO_POLICY_SUFFIX, NAT_TO_LOCAL_SUFFIX, NAT_TO_UPLINK_SUFFIX,
    POLICY_TO_CLS_SUFFIX, POLICY_TO_LOCAL_SUFFIX, UPLINK_TO_CLS_SUFFIX, UPLINK_TO_NAT_SUFFIX,
};
use infrastructure::config::AgentConfig;
use infrastructure::constants::{
    ADDR_POLL_INTERVAL, BRIDGE_EVENT_CHANNEL_CAPACITY, GRACEFUL_SHUTDOWN_TIMEOUT,
};
use infrastructure::metrics::AgentMetrics;

const BASE_SUFFIXES: [&str; 6] = [
    LOCAL_TO_POLICY_SUFFIX,
    POLICY_TO_LOCAL_SUFFIX,
    POLICY_TO_CLS_SUFFIX,
    CLS_TO_POLICY_SUFFIX,
    CLS_TO_UPLINK_SUFFIX,
    UPLINK_TO_CLS_SUFFIX,
];

const NAT_SUFFIXES: [&str; 4] = [
    LOCAL_TO_NAT_SUFFIX,
    NAT_TO_LOCAL_SUFFIX,
    NAT_TO_UPLINK_SUFFIX,
    UPLINK_TO_NAT_SUFFIX,
];

pub async fn run(config: AgentConfig, token: CancellationToken) -> anyhow::Result<()> {
    let metrics = Arc::new(AgentMetrics::new());
    let chains = config.datapath.chains();

    let (switch, bridge_events) = OvsSwitchAdapter::connect(
        &chains,
        &PathBuf::from(&config.datapath.ovs_run_dir),
        BRIDGE_EVENT_CHANNEL_CAPACITY,
        token.clone(),
    );
    let ovsdb = Arc::new(OvsdbClient::new(&config.datapath.ovsdb_sock));
    let chain_ports = discover_patch_ports(&ovsdb, &chains);

    let scheduler = ConntrackScheduler::new(config.datapath.conntrack_queue_capacity);
    let manager = DatapathManager::new(
        DatapathConfig {
            chains: chains.clone(),
            enable_ip_learning: config.datapath.enable_ip_learning,
            local_gateway: config.datapath.local_gateway.clone(),
            settle_delay: config.datapath.settle_delay(),
            internal_ips: config.datapath.parsed_internal_ips(),
        },
        chain_ports,
        switch,
        ovsdb.clone(),
        scheduler.clone(),
        metrics.clone(),
    );
    let mut fatal_rx = manager
        .take_fatal_receiver()
        .expect("fatal receiver taken once");

    manager
        .initialize()
        .await
        .context("datapath initialization failed")?;
    info!("datapath initialized");

    let mut workers = Vec::new();
    let worker = ConntrackWorker::new(scheduler, Arc::new(ConntrackCli::new()), metrics.clone());
    workers.push(tokio::spawn(worker.run(token.clone())));

    let coordinator = ReplayCoordinator::new(manager.clone(), bridge_events);
    workers.push(tokio::spawn(coordinator.run(token.clone())));

    let addr_watch = RtnetlinkAddrWatch::connect(ADDR_POLL_INTERVAL)
        .await
        .context("address subscription setup failed")?;
    let whitelist = InternalIpWhitelist::new(manager.clone(), Arc::new(addr_watch));
    workers.push(tokio::spawn(whitelist.run(token.clone())));

    tokio::select! {
        Some(err) = fatal_rx.recv() => {
            bail!("fatal datapath error: {err}");
        }
        () = token.cancelled() => {
            info!("shutdown signal received");
            let drain = async {
                for worker in workers {
                    let _ = worker.await;
                }
            };
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, drain)
                .await
                .is_err()
            {
                warn!("background workers did not drain before timeout");
            }
            Ok(())
        }
    }
}

/// Discover the `(suffix) → ofport` map of every chain. Missing ports
/// are tolerated; a disabled bridge has no patch ports to find.
fn discover_patch_ports(
    ovsdb: &OvsdbClient,
    chains: &[BridgeChain],
) -> HashMap<ChainId, PatchPortMap> {
    let mut out = HashMap::new();
    for chain in chains {
        let mut ports = PatchPortMap::new();
        let mut suffixes: Vec<&'static str> = BASE_SUFFIXES.to_vec();
        if chain.nat_enabled {
            suffixes.extend(NAT_SUFFIXES);
        }
        for suffix in suffixes {
            let name = chain.patch_port_name(suffix);
            match ovsdb.get_of_port(&name) {
                Ok(Some(port)) => ports.insert(suffix, port),
                Ok(None) => {
                    warn!(chain = %chain.chain, port = name, "patch port has no ofport yet");
                }
                Err(e) => {
                    warn!(chain = %chain.chain, port = name, error = %e,
                        "patch port discovery failed");
                }
            }
        }
        out.insert(chain.chain.clone(), ports);
    }
    out
}
