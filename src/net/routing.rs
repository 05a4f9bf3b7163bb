//! Routing table (`spec.md` §4.2): tracks which node ids are reachable
//! directly over an open connection, and which are only reachable by
//! forwarding through a directly-connected node one hop away.

use crate::net::types::{ConnectionHandle, NodeId};
use std::collections::{HashMap, HashSet};

/// Outcome of adding a direct route.
#[derive(Debug, PartialEq, Eq)]
pub enum AddDirectResult {
    /// The route was new.
    Added,
    /// `node` already had a direct route (possibly over a different
    /// connection); the table is unchanged (`spec.md` §4.2 edge case:
    /// "a second direct connection to an already-direct node is
    /// rejected, not merged").
    AlreadyExists,
}

/// A resolved route: the connection to forward over, and — for an
/// indirect route — the next-hop node whose connection that is.
#[derive(Debug, Clone, Copy)]
pub struct RouteResult {
    pub handle: ConnectionHandle,
    /// `None` for a direct route; `Some(next_hop)` for an indirect one.
    pub next_hop: Option<NodeId>,
}

#[derive(Default)]
pub struct RoutingTable {
    direct: HashMap<NodeId, ConnectionHandle>,
    direct_rev: HashMap<ConnectionHandle, NodeId>,
    /// `target -> set of next-hop nodes known to reach it indirectly`.
    /// A set, not a single node, because more than one directly-connected
    /// peer may claim to reach the same indirect target.
    indirect: HashMap<NodeId, HashSet<NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` is now reachable directly over `handle`.
    /// Idempotent for the identical `(node, handle)` pair — re-adding the
    /// route this connection already owns succeeds rather than being
    /// treated as a conflicting second connection (`spec.md` §4.2).
    pub fn add_direct(&mut self, node: NodeId, handle: ConnectionHandle) -> AddDirectResult {
        match self.direct.get(&node) {
            Some(existing) if *existing == handle => return AddDirectResult::Added,
            Some(_) => return AddDirectResult::AlreadyExists,
            None => {}
        }
        self.direct.insert(node, handle);
        self.direct_rev.insert(handle, node);
        // A node reachable directly is no longer interesting as an
        // indirect target (direct always wins the lookup anyway, but
        // keeping the indirect set tidy avoids stale entries lingering
        // after a later `erase_direct`).
        self.indirect.remove(&node);
        AddDirectResult::Added
    }

    /// Supersede `node`'s direct route with `new_handle`, used when a
    /// duplicate-connection tie-break keeps a different socket than the
    /// one the route table currently holds (`spec.md` §4.2 scenario:
    /// simultaneous mutual connect). Unlike `erase_direct`, `node` stays
    /// reachable throughout, so indirect routes through it are left
    /// alone. Returns the handle that was replaced, if any.
    pub fn replace_direct(&mut self, node: NodeId, new_handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let old = self.direct.insert(node, new_handle);
        if let Some(old_handle) = old {
            self.direct_rev.remove(&old_handle);
        }
        self.direct_rev.insert(new_handle, node);
        old
    }

    /// Record that `target` is reachable by forwarding through
    /// `via` (itself a directly-connected node). Returns `false` if
    /// `via == target` or `target` is already directly connected —
    /// both are no-ops per `spec.md` §4.2.
    pub fn add_indirect(&mut self, via: NodeId, target: NodeId) -> bool {
        if via == target || self.direct.contains_key(&target) {
            return false;
        }
        self.indirect.entry(target).or_default().insert(via);
        true
    }

    /// Remove the direct route over `handle`, cascading to drop any
    /// indirect routes whose next hop was that node (`spec.md` §4.2:
    /// "removing a direct route also removes every indirect route whose
    /// next hop was that node"). Returns the node that was directly
    /// connected over `handle`, if any.
    pub fn erase_direct(&mut self, handle: ConnectionHandle) -> Option<NodeId> {
        let node = self.direct_rev.remove(&handle)?;
        self.direct.remove(&node);

        let mut now_empty = Vec::new();
        for (target, via_set) in self.indirect.iter_mut() {
            via_set.remove(&node);
            if via_set.is_empty() {
                now_empty.push(*target);
            }
        }
        for target in now_empty {
            self.indirect.remove(&target);
        }
        Some(node)
    }

    /// Resolve the best route to `node`: a direct route if one exists,
    /// otherwise an indirect route through the next hop with the
    /// lowest `NodeId` among candidates (`spec.md` §4.2 tie-break:
    /// "deterministic, so two nodes computing a route to the same
    /// target independently agree").
    pub fn lookup(&self, node: NodeId) -> Option<RouteResult> {
        if let Some(handle) = self.direct.get(&node) {
            return Some(RouteResult {
                handle: *handle,
                next_hop: None,
            });
        }
        let via_set = self.indirect.get(&node)?;
        let next_hop = *via_set.iter().min()?;
        let handle = *self.direct.get(&next_hop)?;
        Some(RouteResult {
            handle,
            next_hop: Some(next_hop),
        })
    }

    pub fn is_direct(&self, node: NodeId) -> bool {
        self.direct.contains_key(&node)
    }

    pub fn direct_node_for(&self, handle: ConnectionHandle) -> Option<NodeId> {
        self.direct_rev.get(&handle).copied()
    }

    pub fn direct_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.direct.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        let mut fingerprint = [0u8; 20];
        fingerprint[0] = byte;
        NodeId {
            fingerprint,
            process_id: byte as u32,
        }
    }

    #[test]
    fn direct_route_wins_over_indirect() {
        let mut table = RoutingTable::new();
        let a = node(1);
        let b = node(2);
        table.add_direct(a, ConnectionHandle(10));
        table.add_indirect(a, b);
        table.add_direct(b, ConnectionHandle(20));

        let route = table.lookup(b).unwrap();
        assert_eq!(route.handle, ConnectionHandle(20));
        assert!(route.next_hop.is_none());
    }

    #[test]
    fn indirect_tie_break_is_deterministic() {
        let mut table = RoutingTable::new();
        let target = node(9);
        let via_low = node(1);
        let via_high = node(2);
        table.add_direct(via_low, ConnectionHandle(1));
        table.add_direct(via_high, ConnectionHandle(2));
        table.add_indirect(via_high, target);
        table.add_indirect(via_low, target);

        let route = table.lookup(target).unwrap();
        assert_eq!(route.next_hop, Some(via_low));
        assert_eq!(route.handle, ConnectionHandle(1));
    }

    #[test]
    fn erasing_direct_route_cascades_to_indirect() {
        let mut table = RoutingTable::new();
        let target = node(9);
        let via = node(1);
        table.add_direct(via, ConnectionHandle(1));
        table.add_indirect(via, target);
        assert!(table.lookup(target).is_some());

        let erased = table.erase_direct(ConnectionHandle(1));
        assert_eq!(erased, Some(via));
        assert!(table.lookup(target).is_none());
    }

    #[test]
    fn second_direct_connection_is_rejected() {
        let mut table = RoutingTable::new();
        let a = node(1);
        assert_eq!(
            table.add_direct(a, ConnectionHandle(1)),
            AddDirectResult::Added
        );
        assert_eq!(
            table.add_direct(a, ConnectionHandle(2)),
            AddDirectResult::AlreadyExists
        );
        assert_eq!(table.lookup(a).unwrap().handle, ConnectionHandle(1));
    }

    #[test]
    fn indirect_route_to_self_via_is_rejected() {
        let mut table = RoutingTable::new();
        let a = node(1);
        assert!(!table.add_indirect(a, a));
    }

    #[test]
    fn readding_the_same_direct_handle_is_idempotent() {
        let mut table = RoutingTable::new();
        let a = node(1);
        assert_eq!(table.add_direct(a, ConnectionHandle(1)), AddDirectResult::Added);
        assert_eq!(table.add_direct(a, ConnectionHandle(1)), AddDirectResult::Added);
        assert_eq!(table.lookup(a).unwrap().handle, ConnectionHandle(1));
    }

    #[test]
    fn replace_direct_swaps_handle_without_dropping_indirect_routes() {
        let mut table = RoutingTable::new();
        let target = node(9);
        let via = node(1);
        table.add_direct(via, ConnectionHandle(1));
        table.add_indirect(via, target);

        let replaced = table.replace_direct(via, ConnectionHandle(2));
        assert_eq!(replaced, Some(ConnectionHandle(1)));
        assert_eq!(table.lookup(via).unwrap().handle, ConnectionHandle(2));
        // `via` is still reachable, just over a different socket, so the
        // indirect route through it survives.
        assert!(table.lookup(target).is_some());
        // The old handle no longer maps back to any node.
        assert_eq!(table.direct_node_for(ConnectionHandle(1)), None);
    }
}
