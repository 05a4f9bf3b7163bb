//! Proxy registry (`spec.md` §4.3): tracks the local stand-ins for
//! remote actors so a second `dispatch` to the same `(node, actor)`
//! reuses the existing proxy instead of minting a duplicate.
//!
//! A [`ProxyHandle`] is a cheap `Arc` clone; the registry only holds a
//! [`Weak`] reference. When the last strong handle is dropped, the
//! [`ProxyState`] destructor posts a [`ProxyDropped`] notice back to the
//! broker's command channel so it can ask the remote side to stop
//! forwarding traffic for that actor (`spec.md` §4.3: "losing the last
//! local reference to a remote actor's proxy is itself an event the
//! broker must observe"). This is the same shape as a CAF exit handler,
//! rendered as an ordinary Rust `Drop` impl instead of a callback.

use crate::net::types::{ActorId, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Sent from a [`ProxyState`]'s `Drop` impl when its last strong handle
/// goes away. The channel is unbounded because `Drop` cannot await a
/// bounded send.
#[derive(Debug, Clone, Copy)]
pub struct ProxyDropped {
    pub node: NodeId,
    pub actor: ActorId,
}

struct ProxyState {
    node: NodeId,
    actor: ActorId,
    drop_tx: mpsc::UnboundedSender<ProxyDropped>,
}

impl Drop for ProxyState {
    fn drop(&mut self) {
        let _ = self.drop_tx.send(ProxyDropped {
            node: self.node,
            actor: self.actor,
        });
    }
}

/// A cheap, cloneable handle to a remote actor's local proxy.
#[derive(Clone)]
pub struct ProxyHandle(Arc<ProxyState>);

impl ProxyHandle {
    pub fn node(&self) -> NodeId {
        self.0.node
    }

    pub fn actor(&self) -> ActorId {
        self.0.actor
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("node", &self.0.node)
            .field("actor", &self.0.actor)
            .finish()
    }
}

#[derive(Default)]
pub struct ProxyRegistry {
    entries: HashMap<(NodeId, ActorId), Weak<ProxyState>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a still-live proxy without creating one.
    pub fn get(&self, node: NodeId, actor: ActorId) -> Option<ProxyHandle> {
        self.entries.get(&(node, actor))?.upgrade().map(ProxyHandle)
    }

    /// Resolve the proxy for `(node, actor)`, creating it if this is the
    /// first time it's been seen (`spec.md` §4.3: "make_proxy" /
    /// "resolve_proxy" merged into one idempotent operation, since the
    /// Rust ownership model makes the CAF two-step redundant). The bool
    /// tells the caller whether this call created the entry, so it knows
    /// whether to emit the one-time `monitor_message` to the proxy's
    /// owner (`spec.md` §3: "when created, the broker must emit a
    /// monitor_message to the remote owner").
    pub fn get_or_put(
        &mut self,
        node: NodeId,
        actor: ActorId,
        drop_tx: mpsc::UnboundedSender<ProxyDropped>,
    ) -> (ProxyHandle, bool) {
        if let Some(existing) = self.get(node, actor) {
            return (existing, false);
        }
        let state = Arc::new(ProxyState {
            node,
            actor,
            drop_tx,
        });
        self.entries.insert((node, actor), Arc::downgrade(&state));
        (ProxyHandle(state), true)
    }

    /// A handle that stands for "no real sender", used when a dispatch
    /// frame's source actor id is `ActorId::INVALID`. Never tracked in
    /// the registry — there is nothing to key it by — so dropping it has
    /// no side effect beyond the ordinary drop-notice send, which the
    /// broker ignores for an invalid actor id.
    pub fn anonymous(
        node: NodeId,
        drop_tx: mpsc::UnboundedSender<ProxyDropped>,
    ) -> ProxyHandle {
        ProxyHandle(Arc::new(ProxyState {
            node,
            actor: ActorId::INVALID,
            drop_tx,
        }))
    }

    /// Drop all proxies for `node` (its connection/route was lost).
    /// Returns the actor ids that had a live proxy, for the caller to
    /// turn into local `Down` notifications.
    pub fn erase_node(&mut self, node: NodeId) -> Vec<ActorId> {
        let mut live = Vec::new();
        self.entries.retain(|(n, actor), weak| {
            if *n != node {
                return true;
            }
            if weak.strong_count() > 0 {
                live.push(*actor);
            }
            false
        });
        live
    }

    /// Drop a single proxy explicitly (`spec.md` §4.3 `erase(node, id,
    /// reason)`). Returns whether an entry existed.
    pub fn erase(&mut self, node: NodeId, actor: ActorId) -> bool {
        self.entries.remove(&(node, actor)).is_some()
    }

    /// Reap a registry entry whose `Weak` has gone stale — called after
    /// the broker receives a [`ProxyDropped`] notice, since the `Drop`
    /// impl that produced it can't reach back into the map itself.
    pub fn reap_if_dead(&mut self, node: NodeId, actor: ActorId) {
        if let Some(weak) = self.entries.get(&(node, actor)) {
            if weak.strong_count() == 0 {
                self.entries.remove(&(node, actor));
            }
        }
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
    fn repeated_resolve_returns_same_proxy() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = ProxyRegistry::new();
        let n = node(1);
        let a = ActorId(7);
        let (first, first_created) = registry.get_or_put(n, a, tx.clone());
        let (second, second_created) = registry.get_or_put(n, a, tx);
        assert!(first_created);
        assert!(!second_created);
        assert_eq!(first.node(), second.node());
        assert_eq!(first.actor(), second.actor());
        assert_eq!(registry.entries.len(), 1);
    }

    #[test]
    fn dropping_last_handle_notifies_broker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = ProxyRegistry::new();
        let n = node(2);
        let a = ActorId(3);
        let (handle, created) = registry.get_or_put(n, a, tx);
        assert!(created);
        drop(handle);

        let dropped = rx.try_recv().expect("drop notice sent");
        assert_eq!(dropped.node, n);
        assert_eq!(dropped.actor, a);

        registry.reap_if_dead(n, a);
        assert!(registry.get(n, a).is_none());
    }

    #[test]
    fn erase_node_reports_only_live_proxies() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = ProxyRegistry::new();
        let n = node(5);
        let (held, _) = registry.get_or_put(n, ActorId(1), tx.clone());
        let (_unheld, _) = registry.get_or_put(n, ActorId(2), tx);
        drop(_unheld);

        let live = registry.erase_node(n);
        assert_eq!(live, vec![ActorId(1)]);
        drop(held);
    }
}
