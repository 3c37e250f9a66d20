//! Concurrent endpoint registry, sharded by interface UUID.
//!
//! Readers vastly outnumber writers; each shard carries its own lock so
//! bridge-scoped snapshots never serialise behind unrelated updates.
//! Cross-shard consistency (e.g. the remove+add inside `update`) is the
//! caller's concern: every mutator runs under the datapath replay lock.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use super::entity::Endpoint;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("endpoint {0} already registered")]
    Duplicate(Uuid),

    #[error("endpoint {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug)]
pub struct EndpointRegistry {
    shards: Vec<RwLock<HashMap<Uuid, Endpoint>>>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, uuid: &Uuid) -> &RwLock<HashMap<Uuid, Endpoint>> {
        let idx = uuid.as_bytes()[0] as usize % SHARD_COUNT;
        &self.shards[idx]
    }

    /// Register a new endpoint. Rejects duplicate interface UUIDs.
    pub fn add(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        let mut shard = self.shard(&endpoint.interface_uuid).write();
        if shard.contains_key(&endpoint.interface_uuid) {
            return Err(RegistryError::Duplicate(endpoint.interface_uuid));
        }
        shard.insert(endpoint.interface_uuid, endpoint);
        Ok(())
    }

    /// Remove an endpoint by UUID. Idempotent: returns the removed record
    /// or `None` when the UUID was absent.
    pub fn remove(&self, uuid: &Uuid) -> Option<Endpoint> {
        self.shard(uuid).write().remove(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Endpoint> {
        self.shard(uuid).read().get(uuid).cloned()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.shard(uuid).read().contains_key(uuid)
    }

    /// Snapshot of all endpoints attached to the named bridge.
    pub fn iter_by_bridge(&self, bridge_name: &str) -> Vec<Endpoint> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for ep in shard.read().values() {
                if ep.bridge_name == bridge_name {
                    out.push(ep.clone());
                }
            }
        }
        out
    }

    /// Snapshot of every registered endpoint.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::MacAddr;

    fn ep(name: &str, bridge: &str, port: u32) -> Endpoint {
        Endpoint {
            interface_uuid: Uuid::new_v4(),
            interface_name: name.to_string(),
            bridge_name: bridge.to_string(),
            port_no: port,
            mac: "aa:bb:cc:00:00:01".parse::<MacAddr>().unwrap(),
            ip_addr: None,
            ipv6_addr: None,
            vlan_id: 0,
            trunk: None,
            ip_last_update: None,
        }
    }

    #[test]
    fn add_and_get() {
        let reg = EndpointRegistry::new();
        let e = ep("vnet0", "ovsbr0", 1);
        let uuid = e.interface_uuid;
        reg.add(e).unwrap();
        assert_eq!(reg.get(&uuid).unwrap().interface_name, "vnet0");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_uuid_rejected() {
        let reg = EndpointRegistry::new();
        let e = ep("vnet0", "ovsbr0", 1);
        let dup = e.clone();
        reg.add(e).unwrap();
        assert_eq!(
            reg.add(dup.clone()),
            Err(RegistryError::Duplicate(dup.interface_uuid))
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = EndpointRegistry::new();
        let e = ep("vnet0", "ovsbr0", 1);
        let uuid = e.interface_uuid;
        reg.add(e).unwrap();
        assert!(reg.remove(&uuid).is_some());
        assert!(reg.remove(&uuid).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn iter_by_bridge_filters() {
        let reg = EndpointRegistry::new();
        reg.add(ep("vnet0", "ovsbr0", 1)).unwrap();
        reg.add(ep("vnet1", "ovsbr0", 2)).unwrap();
        reg.add(ep("vnet2", "ovsbr1", 3)).unwrap();
        assert_eq!(reg.iter_by_bridge("ovsbr0").len(), 2);
        assert_eq!(reg.iter_by_bridge("ovsbr1").len(), 1);
        assert_eq!(reg.iter_by_bridge("ovsbr9").len(), 0);
    }

    #[test]
    fn registry_equals_adds_minus_removes() {
        let reg = EndpointRegistry::new();
        let endpoints: Vec<Endpoint> = (0..50).map(|i| ep(&format!("vnet{i}"), "ovsbr0", i)).collect();
        for e in &endpoints {
            reg.add(e.clone()).unwrap();
        }
        for e in endpoints.iter().take(20) {
            reg.remove(&e.interface_uuid);
        }
        assert_eq!(reg.len(), 30);
        for e in endpoints.iter().skip(20) {
            assert!(reg.contains(&e.interface_uuid));
        }
    }
}
