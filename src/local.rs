//! Stand-in for the local actor runtime the broker reports into.
//!
//! `spec.md` treats the local scheduler/mailbox as an external
//! collaborator: the broker's job stops at "deliver this dispatch to
//! actor X" or "tell X that remote actor Y is down". What happens to
//! that message once it's local is someone else's concern. This module
//! is the narrowest thing that lets the rest of the crate compile and
//! be tested against that boundary without pulling in a full actor
//! framework.

use crate::net::codec::PayloadBag;
use crate::net::error::BaspError;
use crate::net::proxy::ProxyHandle;
use crate::net::types::{ActorId, ExitReason, NodeId};
use tokio::sync::mpsc;

/// One notification crossing from the broker into the local system.
#[derive(Debug, Clone)]
pub enum LocalSignal {
    /// A dispatch frame addressed to a local actor id, forwarded with
    /// its originating node attached. `sender_proxy` is the (possibly
    /// freshly-created) proxy standing in for `from_actor`; the recipient
    /// must hold onto it for as long as it wants to keep talking back to
    /// that remote actor; dropping it tells the remote node to stop
    /// monitoring this process on its behalf (`spec.md` §4.3).
    Dispatch {
        from_node: NodeId,
        from_actor: ActorId,
        to_actor: ActorId,
        operation_id: u64,
        payload: PayloadBag,
        sender_proxy: ProxyHandle,
    },
    /// A remote actor this process held a proxy for, or had registered
    /// a monitor on, has gone away.
    Down {
        node: NodeId,
        actor: ActorId,
        reason: ExitReason,
    },
    /// An entire node was lost (last direct connection closed, or the
    /// connection timed out).
    NodeDown { node: NodeId, reason: ExitReason },
}

/// A channel handle the broker holds to push [`LocalSignal`]s out.
/// Cloneable so the broker can hand a copy to the connection helper
/// without giving it access to broker-internal state.
#[derive(Clone)]
pub struct LocalMailbox(mpsc::UnboundedSender<LocalSignal>);

impl LocalMailbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LocalSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn send(&self, signal: LocalSignal) -> Result<(), BaspError> {
        self.0.send(signal).map_err(|_| BaspError::BrokerGone)
    }
}
