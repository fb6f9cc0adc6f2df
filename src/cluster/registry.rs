use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::debug;

/// One cluster member as seen by the registry: its address and two flags.
///
/// Identity is the address alone; equality and hashing ignore the flags.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    addr: SocketAddr,
    seed: bool,
    available: bool,
}

impl Node {
    /// Address of the member.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True if the member is privileged as a bootstrap fallback.
    pub fn is_seed(&self) -> bool {
        self.seed
    }

    /// True if the member was last reported reachable.
    pub fn is_available(&self) -> bool {
        self.available
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeFlags {
    seed: bool,
    available: bool,
}

/// Owns the full set of known hosts and their circular rotation order.
///
/// A host is created the first time it is reported available or unavailable
/// and never removed afterwards, only flag-flipped. Each known host appears in
/// the rotation exactly once, so `rotation.len() == nodes.len()` always holds.
///
/// All state lives behind one mutex, taken only for the in-memory mutation.
/// Liveness probes never run under this lock.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    nodes: HashMap<SocketAddr, NodeFlags>,
    rotation: VecDeque<SocketAddr>,
    unavailable: usize,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `addr` reachable. Unknown hosts are inserted at the rotation's
    /// tail; known hosts have their flag flipped in place.
    pub fn node_available(&self, addr: SocketAddr) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.nodes.entry(addr) {
            Entry::Occupied(mut entry) => {
                if !entry.get().available {
                    debug!(%addr, "node is available again");
                }
                entry.get_mut().available = true;
            }
            Entry::Vacant(entry) => {
                debug!(%addr, "new node reported available");
                entry.insert(NodeFlags {
                    seed: false,
                    available: true,
                });
                inner.rotation.push_back(addr);
            }
        }
        inner.unavailable = inner.unavailable.saturating_sub(1);
    }

    /// Reports `addr` unreachable. Unknown hosts are inserted at the
    /// rotation's tail; known hosts have their flag flipped in place.
    pub fn node_unavailable(&self, addr: SocketAddr) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.nodes.entry(addr) {
            Entry::Occupied(mut entry) => {
                if entry.get().available {
                    debug!(%addr, "node is no longer available");
                }
                entry.get_mut().available = false;
            }
            Entry::Vacant(entry) => {
                debug!(%addr, "new node reported unavailable");
                entry.insert(NodeFlags {
                    seed: false,
                    available: false,
                });
                inner.rotation.push_back(addr);
            }
        }
        if inner.unavailable < inner.nodes.len() {
            inner.unavailable += 1;
        }
    }

    /// Flags a known host as a seed. No-op for unknown hosts.
    pub fn mark_seed(&self, addr: SocketAddr) {
        if let Some(flags) = self.lock().nodes.get_mut(&addr) {
            flags.seed = true;
        }
    }

    /// Clears the seed flag on a known host. No-op for unknown hosts.
    pub fn unmark_seed(&self, addr: SocketAddr) {
        if let Some(flags) = self.lock().nodes.get_mut(&addr) {
            flags.seed = false;
        }
    }

    /// Picks the host that should serve the next attempt.
    ///
    /// Walks the rotation once, starting at the head, advancing the rotation
    /// as it goes. A host is selectable when it is available, or when it is a
    /// seed while every known host is marked unavailable (the bootstrap
    /// escape hatch: without it a transient full-cluster demotion would lock
    /// callers out forever). Returns `None` if the rotation is empty or no
    /// host is selectable; the rotation order is left intact in that case.
    pub fn next_host(&self) -> Option<SocketAddr> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let total = inner.nodes.len();
        let start = inner.rotation.pop_front()?;
        let mut candidate = start;
        loop {
            inner.rotation.push_back(candidate);
            let flags = inner
                .nodes
                .get(&candidate)
                .expect("rotation entry missing from node map");
            if flags.available || (flags.seed && inner.unavailable == total) {
                return Some(candidate);
            }
            candidate = inner
                .rotation
                .pop_front()
                .expect("rotation emptied mid-walk");
            if candidate == start {
                inner.rotation.push_front(candidate);
                return None;
            }
        }
    }

    /// True if `addr` is known and currently marked reachable.
    pub fn is_available(&self, addr: SocketAddr) -> bool {
        self.lock()
            .nodes
            .get(&addr)
            .is_some_and(|flags| flags.available)
    }

    /// Snapshot of all known host addresses, in rotation order.
    pub fn hosts(&self) -> Vec<SocketAddr> {
        self.lock().rotation.iter().copied().collect()
    }

    /// Snapshot of all known nodes with their flags, in rotation order.
    pub fn nodes(&self) -> Vec<Node> {
        let guard = self.lock();
        guard
            .rotation
            .iter()
            .map(|addr| {
                let flags = guard
                    .nodes
                    .get(addr)
                    .expect("rotation entry missing from node map");
                Node {
                    addr: *addr,
                    seed: flags.seed,
                    available: flags.available,
                }
            })
            .collect()
    }

    /// Number of known hosts.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    /// True if no host has been reported yet.
    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("node registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(last_octet: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last_octet], 7000))
    }

    fn registry_of(addrs: &[SocketAddr]) -> NodeRegistry {
        let registry = NodeRegistry::new();
        for a in addrs {
            registry.node_available(*a);
        }
        registry
    }

    #[test]
    fn rotation_is_a_permutation_and_wraps() {
        let hosts = [addr(1), addr(2), addr(3)];
        let registry = registry_of(&hosts);

        let picked: Vec<_> = (0..3).map(|_| registry.next_host().unwrap()).collect();
        let unique: HashSet<_> = picked.iter().copied().collect();
        assert_eq!(unique, hosts.iter().copied().collect::<HashSet<_>>());

        // The fourth call repeats the first.
        assert_eq!(registry.next_host().unwrap(), picked[0]);
    }

    #[test]
    fn unavailable_host_is_skipped_until_recovered() {
        let hosts = [addr(1), addr(2), addr(3)];
        let registry = registry_of(&hosts);
        registry.node_unavailable(addr(2));

        for _ in 0..10 {
            assert_ne!(registry.next_host().unwrap(), addr(2));
        }

        registry.node_available(addr(2));
        let picked: HashSet<_> = (0..3).map(|_| registry.next_host().unwrap()).collect();
        assert!(picked.contains(&addr(2)));
    }

    #[test]
    fn seed_is_returned_when_every_host_is_down() {
        let hosts = [addr(1), addr(2), addr(3)];
        let registry = registry_of(&hosts);
        registry.mark_seed(addr(1));
        for a in hosts {
            registry.node_unavailable(a);
        }

        for _ in 0..5 {
            assert_eq!(registry.next_host(), Some(addr(1)));
        }
    }

    #[test]
    fn seed_fallback_stops_once_any_host_recovers() {
        let registry = registry_of(&[addr(1), addr(2)]);
        registry.mark_seed(addr(1));
        registry.node_unavailable(addr(1));
        registry.node_unavailable(addr(2));
        assert_eq!(registry.next_host(), Some(addr(1)));

        registry.node_available(addr(2));
        for _ in 0..4 {
            assert_eq!(registry.next_host(), Some(addr(2)));
        }
    }

    #[test]
    fn no_selectable_host_yields_none_and_keeps_rotation_intact() {
        let registry = registry_of(&[addr(1), addr(2)]);
        registry.node_unavailable(addr(1));
        registry.node_unavailable(addr(2));

        assert_eq!(registry.next_host(), None);
        assert_eq!(registry.hosts().len(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn empty_registry_yields_none() {
        let registry = NodeRegistry::new();
        assert_eq!(registry.next_host(), None);
    }

    #[test]
    fn flapping_host_is_never_duplicated() {
        let registry = registry_of(&[addr(1), addr(2)]);
        for _ in 0..7 {
            registry.node_unavailable(addr(1));
            registry.node_available(addr(1));
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.hosts().len(), 2);
    }

    #[test]
    fn unavailable_count_stays_clamped() {
        let registry = NodeRegistry::new();
        // Repeated demotions of the same host must not push the counter past
        // the node count, otherwise the seed fallback could never trigger.
        for _ in 0..5 {
            registry.node_unavailable(addr(1));
        }
        registry.mark_seed(addr(1));
        assert_eq!(registry.next_host(), Some(addr(1)));

        // Repeated promotions must not underflow either: a single demotion
        // afterwards still counts as "everything down".
        let registry = NodeRegistry::new();
        for _ in 0..5 {
            registry.node_available(addr(1));
        }
        assert_eq!(registry.next_host(), Some(addr(1)));
        registry.node_unavailable(addr(1));
        assert_eq!(registry.next_host(), None);
        registry.mark_seed(addr(1));
        assert_eq!(registry.next_host(), Some(addr(1)));
    }

    #[test]
    fn mark_seed_on_unknown_host_is_a_noop() {
        let registry = NodeRegistry::new();
        registry.mark_seed(addr(9));
        assert!(registry.is_empty());
    }

    #[test]
    fn unmark_seed_disables_the_fallback() {
        let registry = registry_of(&[addr(1)]);
        registry.mark_seed(addr(1));
        registry.unmark_seed(addr(1));
        registry.node_unavailable(addr(1));
        assert_eq!(registry.next_host(), None);
    }

    #[test]
    fn is_available_is_false_for_unknown_hosts() {
        let registry = NodeRegistry::new();
        assert!(!registry.is_available(addr(1)));
    }

    #[test]
    fn nodes_snapshot_reflects_flags() {
        let registry = registry_of(&[addr(1), addr(2)]);
        registry.mark_seed(addr(1));
        registry.node_unavailable(addr(2));

        let nodes = registry.nodes();
        let n1 = nodes.iter().find(|n| n.addr() == addr(1)).unwrap();
        let n2 = nodes.iter().find(|n| n.addr() == addr(2)).unwrap();
        assert!(n1.is_seed() && n1.is_available());
        assert!(!n2.is_seed() && !n2.is_available());
    }
}
