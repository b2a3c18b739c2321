use std::net::SocketAddr;

use dashmap::DashMap;

use crate::identity::ClusterIdentity;

/// Concurrent two-way record of which network addresses a cluster member was seen on.
///
/// Both directions are updated from the receiver tasks for every inbound chunk or
///  request frame. A member can be reachable on several addresses (one per interface);
///  newly seen addresses are prepended, and the list head is the preferred route. That
///  makes route preference last-writer-wins modulo race order - deliberately not a
///  performance-ranked routing decision.
pub struct AddressMap {
    address_to_id: DashMap<SocketAddr, ClusterIdentity>,
    id_to_addresses: DashMap<ClusterIdentity, Vec<SocketAddr>>,
}

impl Default for AddressMap {
    fn default() -> Self {
        AddressMap::new()
    }
}

impl AddressMap {
    pub fn new() -> AddressMap {
        AddressMap {
            address_to_id: DashMap::new(),
            id_to_addresses: DashMap::new(),
        }
    }

    pub fn record(&self, id: ClusterIdentity, address: SocketAddr) {
        self.address_to_id.insert(address, id);

        let mut addresses = self.id_to_addresses.entry(id).or_default();
        if !addresses.contains(&address) {
            addresses.insert(0, address);
        }
    }

    /// the preferred (most recently first-seen) address for a member, if any is known
    pub fn preferred_address(&self, id: &ClusterIdentity) -> Option<SocketAddr> {
        self.id_to_addresses
            .get(id)
            .and_then(|addresses| addresses.first().copied())
    }

    pub fn identity_at(&self, address: &SocketAddr) -> Option<ClusterIdentity> {
        self.address_to_id.get(address).map(|id| *id)
    }

    pub fn known_addresses(&self, id: &ClusterIdentity) -> Vec<SocketAddr> {
        self.id_to_addresses
            .get(id)
            .map(|addresses| addresses.clone())
            .unwrap_or_default()
    }
}
