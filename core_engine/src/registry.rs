//! Concurrent tunnel registry.
//!
//! Maps tunnel ids to their connection handles and owned addresses. IP
//! ownership lives in a reverse index (`owners`) that is the single source of
//! truth: a route is granted by an insert-if-absent on that index, so two
//! tunnels racing for one address cannot both win.
//!
//! Lock order is always `tunnels` shard first, then `owners` shard. No code
//! path touches `tunnels` while holding an `owners` guard.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use shared_utils::transport::Connection;
use shared_utils::tunnel::TunnelId;
use tracing::{debug, trace};

/// Outcome of [`TunnelRegistry::add_ip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpClaim {
    /// The address now belongs to the tunnel.
    Granted,
    /// The tunnel already owned the address.
    AlreadyOwned,
    /// Another live tunnel owns the address.
    Conflict(TunnelId),
    /// The tunnel does not exist (never added or already removed).
    NoTunnel,
}

impl IpClaim {
    /// Whether the tunnel owns the address after the call.
    pub fn is_owned(&self) -> bool {
        matches!(self, IpClaim::Granted | IpClaim::AlreadyOwned)
    }
}

struct Entry {
    conn: Arc<dyn Connection>,
    ips: HashSet<IpAddr>,
    live: bool,
}

/// Tunnel id → (connection, owned addresses), plus the address → tunnel index.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<TunnelId, Entry>,
    owners: DashMap<IpAddr, TunnelId>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel with no addresses. Replaces an existing entry with the
    /// same id, releasing the addresses it held.
    pub fn add_tunnel(&self, id: TunnelId, conn: Arc<dyn Connection>) {
        if self.remove_tunnel(&id).is_some() {
            debug!(tunnel_id = %id, "replaced existing tunnel entry");
        }
        self.tunnels.insert(
            id,
            Entry {
                conn,
                ips: HashSet::new(),
                live: true,
            },
        );
    }

    /// Remove a tunnel and release every address it owned.
    ///
    /// Returns the handle only to the caller that actually removed the
    /// tunnel; later and concurrent callers get `None`.
    pub fn remove_tunnel(&self, id: &TunnelId) -> Option<Arc<dyn Connection>> {
        {
            let mut entry = self.tunnels.get_mut(id)?;
            if !entry.live {
                return None;
            }
            entry.live = false;
            for ip in entry.ips.drain() {
                self.owners.remove_if(&ip, |_, owner| owner == id);
            }
        }
        let (_, entry) = self.tunnels.remove_if(id, |_, entry| !entry.live)?;
        trace!(tunnel_id = %id, "tunnel removed from registry");
        Some(entry.conn)
    }

    pub fn get_connection(&self, id: &TunnelId) -> Option<Arc<dyn Connection>> {
        self.tunnels
            .get(id)
            .filter(|entry| entry.live)
            .map(|entry| Arc::clone(&entry.conn))
    }

    pub fn contains(&self, id: &TunnelId) -> bool {
        self.get_connection(id).is_some()
    }

    /// Claim `ip` for tunnel `id`.
    pub fn add_ip(&self, id: &TunnelId, ip: IpAddr) -> IpClaim {
        let Some(mut entry) = self.tunnels.get_mut(id) else {
            return IpClaim::NoTunnel;
        };
        if !entry.live {
            return IpClaim::NoTunnel;
        }

        let claim = match self.owners.entry(ip) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(id.clone());
                IpClaim::Granted
            }
            MapEntry::Occupied(occupied) if occupied.get() == id => IpClaim::AlreadyOwned,
            MapEntry::Occupied(occupied) => IpClaim::Conflict(occupied.get().clone()),
        };
        if claim == IpClaim::Granted {
            entry.ips.insert(ip);
        }
        claim
    }

    /// Release `ip` from tunnel `id`. Returns whether it was owned.
    pub fn del_ip(&self, id: &TunnelId, ip: IpAddr) -> bool {
        let Some(mut entry) = self.tunnels.get_mut(id) else {
            return false;
        };
        if !entry.ips.remove(&ip) {
            return false;
        }
        self.owners.remove_if(&ip, |_, owner| owner == id);
        true
    }

    pub fn has_ip(&self, id: &TunnelId, ip: IpAddr) -> bool {
        self.owners.get(&ip).is_some_and(|owner| owner.value() == id)
    }

    pub fn has_ip_in_any_tunnel(&self, ip: IpAddr) -> bool {
        self.owners.contains_key(&ip)
    }

    /// Owner of `ip` and its connection, if the owner is still live.
    pub fn lookup(&self, ip: IpAddr) -> Option<(TunnelId, Arc<dyn Connection>)> {
        let owner = self.owners.get(&ip).map(|owner| owner.value().clone())?;
        let conn = self.get_connection(&owner)?;
        Some((owner, conn))
    }

    /// Addresses owned by a tunnel, sorted.
    pub fn routes_of(&self, id: &TunnelId) -> Vec<IpAddr> {
        let mut routes: Vec<IpAddr> = self
            .tunnels
            .get(id)
            .map(|entry| entry.ips.iter().copied().collect())
            .unwrap_or_default();
        routes.sort();
        routes
    }

    /// Ids of every live tunnel.
    pub fn tunnel_ids(&self) -> Vec<TunnelId> {
        self.tunnels
            .iter()
            .filter(|entry| entry.live)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Live tunnels only; an entry mid-removal is not counted.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.iter().filter(|entry| entry.live).count()
    }

    pub fn route_count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_utils::transport::ChannelConnection;

    fn conn() -> Arc<dyn Connection> {
        let (a, _b) = ChannelConnection::pair(4);
        Arc::new(a)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tunnel_lifecycle() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        let handle = conn();

        assert!(registry.get_connection(&t1).is_none());
        registry.add_tunnel(t1.clone(), Arc::clone(&handle));

        let found = registry.get_connection(&t1).unwrap();
        assert!(Arc::ptr_eq(&found, &handle));

        assert!(registry.remove_tunnel(&t1).is_some());
        assert!(registry.get_connection(&t1).is_none());
        assert!(registry.remove_tunnel(&t1).is_none());
        assert_eq!(registry.tunnel_count(), 0);
    }

    #[test]
    fn test_add_and_del_ip() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        registry.add_tunnel(t1.clone(), conn());

        assert_eq!(registry.add_ip(&t1, ip("10.8.0.2")), IpClaim::Granted);
        assert!(registry.has_ip(&t1, ip("10.8.0.2")));
        assert!(registry.has_ip_in_any_tunnel(ip("10.8.0.2")));
        assert_eq!(registry.add_ip(&t1, ip("10.8.0.2")), IpClaim::AlreadyOwned);

        assert!(registry.del_ip(&t1, ip("10.8.0.2")));
        assert!(!registry.has_ip(&t1, ip("10.8.0.2")));
        assert!(!registry.has_ip_in_any_tunnel(ip("10.8.0.2")));
        assert!(!registry.del_ip(&t1, ip("10.8.0.2")));
    }

    #[test]
    fn test_conflict_between_tunnels() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        let t2 = TunnelId::from("t2");
        registry.add_tunnel(t1.clone(), conn());
        registry.add_tunnel(t2.clone(), conn());

        assert_eq!(registry.add_ip(&t1, ip("10.8.0.5")), IpClaim::Granted);
        assert_eq!(
            registry.add_ip(&t2, ip("10.8.0.5")),
            IpClaim::Conflict(t1.clone())
        );
        assert!(!registry.has_ip(&t2, ip("10.8.0.5")));

        // t2 cannot release what it does not own
        assert!(!registry.del_ip(&t2, ip("10.8.0.5")));
        assert!(registry.has_ip(&t1, ip("10.8.0.5")));
    }

    #[test]
    fn test_remove_tunnel_releases_addresses() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        registry.add_tunnel(t1.clone(), conn());
        registry.add_ip(&t1, ip("10.8.0.2"));
        registry.add_ip(&t1, ip("fd00::2"));
        assert_eq!(registry.routes_of(&t1).len(), 2);

        registry.remove_tunnel(&t1);
        assert!(!registry.has_ip_in_any_tunnel(ip("10.8.0.2")));
        assert!(!registry.has_ip_in_any_tunnel(ip("fd00::2")));
        assert_eq!(registry.route_count(), 0);
        assert!(registry.routes_of(&t1).is_empty());
    }

    #[test]
    fn test_operations_on_absent_tunnel_are_noops() {
        let registry = TunnelRegistry::new();
        let ghost = TunnelId::from("ghost");

        assert_eq!(registry.add_ip(&ghost, ip("10.8.0.9")), IpClaim::NoTunnel);
        assert!(!registry.del_ip(&ghost, ip("10.8.0.9")));
        assert!(!registry.has_ip(&ghost, ip("10.8.0.9")));
        assert!(!registry.has_ip_in_any_tunnel(ip("10.8.0.9")));
        assert!(registry.lookup(ip("10.8.0.9")).is_none());
    }

    #[test]
    fn test_lookup_returns_owner() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        let handle = conn();
        registry.add_tunnel(t1.clone(), Arc::clone(&handle));
        registry.add_ip(&t1, ip("10.8.0.2"));

        let (owner, found) = registry.lookup(ip("10.8.0.2")).unwrap();
        assert_eq!(owner, t1);
        assert!(Arc::ptr_eq(&found, &handle));
    }

    #[test]
    fn test_add_tunnel_replaces_entry() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        registry.add_tunnel(t1.clone(), conn());
        registry.add_ip(&t1, ip("10.8.0.2"));

        let replacement = conn();
        registry.add_tunnel(t1.clone(), Arc::clone(&replacement));

        assert!(Arc::ptr_eq(
            &registry.get_connection(&t1).unwrap(),
            &replacement
        ));
        assert!(!registry.has_ip_in_any_tunnel(ip("10.8.0.2")));
        assert_eq!(registry.tunnel_count(), 1);
    }

    #[test]
    fn test_entry_mid_removal_is_not_counted() {
        let registry = TunnelRegistry::new();
        let t1 = TunnelId::from("t1");
        let t2 = TunnelId::from("t2");
        registry.add_tunnel(t1.clone(), conn());
        registry.add_tunnel(t2.clone(), conn());

        // State between the liveness flip and the map removal
        registry.tunnels.get_mut(&t1).unwrap().live = false;

        assert_eq!(registry.tunnel_count(), 1);
        assert_eq!(registry.tunnel_ids(), vec![t2]);
        assert!(!registry.contains(&t1));
    }
}
