//! The BASP instance (`spec.md` §4.4): pure encode/decode orchestration
//! over a [`Callee`] collaborator. This module never touches a socket
//! and never owns routing or proxy state directly — it only knows how
//! to turn outgoing intents into bytes and incoming bytes into calls on
//! `Callee`, which `broker.rs` implements against its own state.
//!
//! CAF's `basp::instance` reaches for a thread-local "last hop" when
//! resolving a proxy during dispatch; `SPEC_FULL.md` §4.4 flags that as
//! the one place the design should change shape in translation, so
//! `last_hop` travels here as an explicit parameter instead.

use crate::net::codec::{
    encode_node_id, encode_string, HandshakePayload, Header, MessageKind, OutboundEntry,
    OutboundPayload, PayloadBag, TypeId, TypeTable, FLAG_DEST_NAMED,
};
use crate::net::error::BaspError;
use crate::net::types::{ActorId, ConnectionHandle, NamedReceiver, NodeId};

/// Resolved destination of a dispatch frame.
#[derive(Debug, Clone, Copy)]
pub enum DispatchTarget {
    Actor(ActorId),
    Named(NamedReceiver),
}

impl DispatchTarget {
    fn to_wire(self) -> (ActorId, bool) {
        match self {
            DispatchTarget::Actor(id) => (id, false),
            DispatchTarget::Named(named) => (named.actor_id(), true),
        }
    }

    fn from_wire(id: ActorId, named: bool) -> Self {
        if named {
            NamedReceiver::from_actor_id(id)
                .map(DispatchTarget::Named)
                .unwrap_or(DispatchTarget::Actor(id))
        } else {
            DispatchTarget::Actor(id)
        }
    }
}

/// Callbacks the instance drives while decoding an incoming frame.
/// Implemented by [`crate::net::broker::Broker`]; kept as a trait so the
/// decode logic here can be exercised against a fake in tests without a
/// live broker.
pub trait Callee {
    /// The peer on `conn` completed its handshake as `node`, declaring
    /// `signatures`. `published_actor` is only meaningful on a server
    /// handshake (`spec.md` §6's header `dest_actor` slot, repurposed
    /// here to carry the actor published at the port we connected to
    /// rather than being unused for handshake frames): it is the actor
    /// id a `connect()` caller should be handed back, or
    /// `ActorId::INVALID` on a client handshake / when nothing is
    /// published there.
    fn finalize_handshake(
        &mut self,
        conn: ConnectionHandle,
        node: NodeId,
        published_actor: ActorId,
        signatures: Vec<String>,
    );

    /// `node` is now known to be reachable through a node one hop away
    /// (learned from that peer's handshake signature list or a later
    /// dispatch `source` field we hadn't seen before).
    fn learned_new_indirect_node(&mut self, via: NodeId, node: NodeId);

    /// A dispatch frame arrived. `last_hop` is the node this frame
    /// physically arrived from (`conn`'s peer), passed explicitly so
    /// proxy resolution never needs hidden thread-local state.
    fn deliver_dispatch(
        &mut self,
        conn: ConnectionHandle,
        last_hop: NodeId,
        source: ActorId,
        dest: DispatchTarget,
        operation_id: u64,
        payload: PayloadBag,
    );

    fn deliver_monitor(&mut self, conn: ConnectionHandle, watched: ActorId);
    fn deliver_demonitor(&mut self, conn: ConnectionHandle, watched: ActorId);
    fn deliver_down(&mut self, conn: ConnectionHandle, actor: ActorId, reason_code: u64);
    fn deliver_add_type(&mut self, conn: ConnectionHandle, type_id: TypeId, name: String);

    /// The frame was well-formed BASP but violated a protocol invariant
    /// for this connection's current phase (e.g. a second handshake).
    /// `spec.md` §4.1: the broker closes the connection on this.
    fn protocol_violation(&mut self, conn: ConnectionHandle, message: String);
}

/// This node's view of itself when encoding frames. Carries no
/// per-connection state — that lives in [`crate::net::context::ConnectionContext`].
pub struct BaspInstance {
    pub this_node: NodeId,
}

impl BaspInstance {
    pub fn new(this_node: NodeId) -> Self {
        Self { this_node }
    }

    pub fn write_server_handshake(
        &self,
        listen_port: u16,
        published_actor: ActorId,
        signatures: &[String],
    ) -> Vec<u8> {
        let payload = HandshakePayload {
            node: self.this_node,
            listen_port: Some(listen_port),
            signatures: signatures.to_vec(),
        };
        let mut body = Vec::new();
        payload.encode(&mut body);
        self.frame(MessageKind::ServerHandshake, 0, ActorId::INVALID, published_actor, body)
    }

    pub fn write_client_handshake(&self, signatures: &[String]) -> Vec<u8> {
        let payload = HandshakePayload {
            node: self.this_node,
            listen_port: None,
            signatures: signatures.to_vec(),
        };
        let mut body = Vec::new();
        payload.encode(&mut body);
        self.frame(MessageKind::ClientHandshake, 0, ActorId::INVALID, ActorId::INVALID, body)
    }

    pub fn write_add_type(&self, type_id: TypeId, name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&type_id.to_be_bytes());
        encode_string(&mut body, name);
        self.frame(MessageKind::AddType, 0, ActorId::INVALID, ActorId::INVALID, body)
    }

    /// Frame one dispatch, compacting every [`OutboundEntry::Named`] entry
    /// through `outbound_types` (`spec.md` §4.1: "the first time a sender
    /// emits a value of type T over connection c, it writes an add_type
    /// control frame ... subsequent dispatch frames refer only to n").
    /// Returns the `add_type` frames that must be sent first, in order,
    /// followed by the dispatch frame itself — the caller writes all of
    /// them to the same connection buffer in the order returned.
    pub fn write_dispatch(
        &self,
        outbound_types: &mut TypeTable,
        source: ActorId,
        dest: DispatchTarget,
        operation_id: u64,
        payload: &OutboundPayload,
    ) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut bag = PayloadBag::new();
        for entry in &payload.0 {
            match entry {
                OutboundEntry::Named(name, value) => {
                    let (type_id, is_new) = outbound_types.outbound_id_for(name);
                    if is_new {
                        frames.push(self.write_add_type(type_id, name));
                    }
                    bag.push(type_id, value.clone());
                }
                OutboundEntry::Raw(type_id, value) => {
                    bag.push(*type_id, value.clone());
                }
            }
        }

        let (dest_id, named) = dest.to_wire();
        let mut body = Vec::new();
        bag.encode(&mut body);
        let flags = if named { FLAG_DEST_NAMED } else { 0 };
        frames.push(self.frame_with_flags(
            MessageKind::Dispatch,
            flags,
            operation_id,
            source,
            dest_id,
            body,
        ));
        frames
    }

    pub fn write_monitor(&self, watched: ActorId) -> Vec<u8> {
        self.frame(MessageKind::Monitor, 0, ActorId::INVALID, watched, Vec::new())
    }

    pub fn write_demonitor(&self, watched: ActorId) -> Vec<u8> {
        self.frame(MessageKind::Demonitor, 0, ActorId::INVALID, watched, Vec::new())
    }

    pub fn write_down(&self, actor: ActorId, reason_code: u64) -> Vec<u8> {
        self.frame_with_flags(MessageKind::Down, 0, reason_code, ActorId::INVALID, actor, Vec::new())
    }

    pub fn write_heartbeat(&self) -> Vec<u8> {
        let header = Header::heartbeat();
        let mut buf = Vec::with_capacity(crate::net::types::HEADER_SIZE);
        header.encode(&mut buf);
        buf
    }

    fn frame(
        &self,
        kind: MessageKind,
        flags: u8,
        source: ActorId,
        dest: ActorId,
        body: Vec<u8>,
    ) -> Vec<u8> {
        self.frame_with_flags(kind, flags, 0, source, dest, body)
    }

    fn frame_with_flags(
        &self,
        kind: MessageKind,
        flags: u8,
        operation_id: u64,
        source: ActorId,
        dest: ActorId,
        body: Vec<u8>,
    ) -> Vec<u8> {
        let header = Header {
            kind,
            flags,
            payload_len: body.len() as u32,
            operation_id,
            source_actor: source,
            dest_actor: dest,
        };
        let mut buf = Vec::with_capacity(crate::net::types::HEADER_SIZE + body.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&body);
        buf
    }

    /// Decode one already-length-delimited frame (header + matching
    /// payload slice) and drive the matching `Callee` callback.
    ///
    /// `peer_node`/`handshake_done` describe the connection's current
    /// state as understood by `context.rs`; this function enforces the
    /// ordering invariant from `spec.md` §4.1 ("no frame but a handshake
    /// is accepted before the handshake completes") but does not itself
    /// mutate the connection context — the broker applies whatever
    /// state transition the callback implies.
    pub fn handle(
        &self,
        conn: ConnectionHandle,
        header: &Header,
        payload: &[u8],
        peer_node: Option<NodeId>,
        inbound_types: &mut TypeTable,
        callee: &mut dyn Callee,
    ) -> Result<(), BaspError> {
        if peer_node.is_none() {
            return self.handle_handshake(conn, header, payload, callee);
        }

        match header.kind {
            MessageKind::ServerHandshake | MessageKind::ClientHandshake => {
                callee.protocol_violation(conn, "duplicate handshake".into());
                Err(BaspError::Protocol("duplicate handshake".into()))
            }
            MessageKind::Dispatch => {
                let bag = PayloadBag::decode(payload)?;
                let dest = DispatchTarget::from_wire(header.dest_actor, header.dest_is_named());
                callee.deliver_dispatch(
                    conn,
                    peer_node.unwrap(),
                    header.source_actor,
                    dest,
                    header.operation_id,
                    bag,
                );
                Ok(())
            }
            MessageKind::Monitor => {
                callee.deliver_monitor(conn, header.dest_actor);
                Ok(())
            }
            MessageKind::Demonitor => {
                callee.deliver_demonitor(conn, header.dest_actor);
                Ok(())
            }
            MessageKind::Down => {
                callee.deliver_down(conn, header.dest_actor, header.operation_id);
                Ok(())
            }
            MessageKind::Heartbeat => Ok(()),
            MessageKind::AddType => {
                let (type_id, name) = TypeTable::decode_add_type(payload)?;
                inbound_types.register_inbound(type_id, name.clone());
                callee.deliver_add_type(conn, type_id, name);
                Ok(())
            }
        }
    }

    fn handle_handshake(
        &self,
        conn: ConnectionHandle,
        header: &Header,
        payload: &[u8],
        callee: &mut dyn Callee,
    ) -> Result<(), BaspError> {
        let has_port = match header.kind {
            MessageKind::ServerHandshake => true,
            MessageKind::ClientHandshake => false,
            other => {
                let message = format!("expected handshake, got {other:?}");
                callee.protocol_violation(conn, message.clone());
                return Err(BaspError::Protocol(message));
            }
        };
        let decoded = HandshakePayload::decode(payload, has_port)?;
        callee.finalize_handshake(conn, decoded.node, header.dest_actor, decoded.signatures);
        Ok(())
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

    struct RecordingCallee {
        handshakes: Vec<(NodeId, ActorId, Vec<String>)>,
        dispatches: Vec<(ActorId, u64)>,
    }

    impl Callee for RecordingCallee {
        fn finalize_handshake(
            &mut self,
            _conn: ConnectionHandle,
            node: NodeId,
            published_actor: ActorId,
            signatures: Vec<String>,
        ) {
            self.handshakes.push((node, published_actor, signatures));
        }
        fn learned_new_indirect_node(&mut self, _via: NodeId, _node: NodeId) {}
        fn deliver_dispatch(
            &mut self,
            _conn: ConnectionHandle,
            _last_hop: NodeId,
            source: ActorId,
            _dest: DispatchTarget,
            operation_id: u64,
            _payload: PayloadBag,
        ) {
            self.dispatches.push((source, operation_id));
        }
        fn deliver_monitor(&mut self, _conn: ConnectionHandle, _watched: ActorId) {}
        fn deliver_demonitor(&mut self, _conn: ConnectionHandle, _watched: ActorId) {}
        fn deliver_down(&mut self, _conn: ConnectionHandle, _actor: ActorId, _reason_code: u64) {}
        fn deliver_add_type(&mut self, _conn: ConnectionHandle, _type_id: TypeId, _name: String) {}
        fn protocol_violation(&mut self, _conn: ConnectionHandle, _message: String) {}
    }

    #[test]
    fn handshake_round_trips_through_the_wire() {
        let instance = BaspInstance::new(node(1));
        let frame = instance.write_server_handshake(4242, ActorId(7), &["iface::v1".to_string()]);

        let header = Header::decode(&frame[..crate::net::types::HEADER_SIZE]).unwrap();
        let body = &frame[crate::net::types::HEADER_SIZE..];
        assert_eq!(body.len(), header.payload_len as usize);

        let mut callee = RecordingCallee {
            handshakes: Vec::new(),
            dispatches: Vec::new(),
        };
        let mut inbound_types = TypeTable::new();
        instance
            .handle(ConnectionHandle(1), &header, body, None, &mut inbound_types, &mut callee)
            .unwrap();

        assert_eq!(callee.handshakes.len(), 1);
        assert_eq!(callee.handshakes[0].0, node(1));
        assert_eq!(callee.handshakes[0].1, ActorId(7));
        assert_eq!(callee.handshakes[0].2, vec!["iface::v1".to_string()]);
    }

    #[test]
    fn dispatch_requires_prior_handshake() {
        let instance = BaspInstance::new(node(1));
        let mut outbound_types = TypeTable::new();
        let mut payload = OutboundPayload::new();
        payload.push_named("hello::v1", b"hello".to_vec());
        let frames = instance.write_dispatch(
            &mut outbound_types,
            ActorId(5),
            DispatchTarget::Actor(ActorId(6)),
            99,
            &payload,
        );
        // A fresh type name costs an add_type frame ahead of the dispatch frame.
        assert_eq!(frames.len(), 2);
        let frame = frames.last().unwrap();

        let header = Header::decode(&frame[..crate::net::types::HEADER_SIZE]).unwrap();
        let body = &frame[crate::net::types::HEADER_SIZE..];

        let mut callee = RecordingCallee {
            handshakes: Vec::new(),
            dispatches: Vec::new(),
        };
        let mut inbound_types = TypeTable::new();
        let err = instance
            .handle(ConnectionHandle(1), &header, body, None, &mut inbound_types, &mut callee)
            .unwrap_err();
        assert!(matches!(err, BaspError::Protocol(_)));
        assert!(callee.dispatches.is_empty());
    }

    #[test]
    fn dispatch_after_handshake_is_delivered() {
        let instance = BaspInstance::new(node(1));
        let mut outbound_types = TypeTable::new();
        let mut payload = OutboundPayload::new();
        payload.push_raw(1, b"hello".to_vec());
        let frames = instance.write_dispatch(
            &mut outbound_types,
            ActorId(5),
            DispatchTarget::Actor(ActorId(6)),
            99,
            &payload,
        );
        // A raw type id needs no add_type frame.
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        let header = Header::decode(&frame[..crate::net::types::HEADER_SIZE]).unwrap();
        let body = &frame[crate::net::types::HEADER_SIZE..];

        let mut callee = RecordingCallee {
            handshakes: Vec::new(),
            dispatches: Vec::new(),
        };
        let mut inbound_types = TypeTable::new();
        instance
            .handle(ConnectionHandle(1), &header, body, Some(node(2)), &mut inbound_types, &mut callee)
            .unwrap();
        assert_eq!(callee.dispatches, vec![(ActorId(5), 99)]);
    }
}
