//! Per-connection state (`spec.md` §3, §4.1): the parser phase state
//! machine, the peer's identity once known, and the two type tables
//! that make dispatch payloads cheap to re-send.

use crate::net::codec::TypeTable;
use crate::net::error::BaspError;
use crate::net::types::{ActorId, ConnectionHandle, NodeId};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Which part of a frame the reader task is waiting for.
///
/// `fresh -> await_header` happens once, right after accept/connect.
/// `await_header <-> await_payload` is the steady-state cycle: a header
/// with `payload_len == 0` (heartbeat, monitor, demonitor, down) skips
/// `await_payload` entirely and loops straight back to `await_header`
/// (`spec.md` §4.1 edge case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserPhase {
    Fresh,
    AwaitHeader,
    AwaitPayload,
    Closed,
}

/// State the broker keeps for one open connection. Owned exclusively by
/// the broker task; the reader/writer tasks for this connection only
/// ever see it through messages on their channels, never by shared
/// reference (`SPEC_FULL.md` §5).
pub struct ConnectionContext {
    pub handle: ConnectionHandle,
    pub phase: ParserPhase,

    /// Remote socket address this connection was accepted from or
    /// opened to. Kept so a lost connection can be retried by the
    /// connection helper (`spec.md` §4.6).
    pub peer_addr: SocketAddr,

    /// Known once the peer's handshake frame has been decoded.
    pub peer_node: Option<NodeId>,
    /// The peer's own listen port, learned from its handshake payload;
    /// used by the connection helper to try upgrading an indirect route.
    pub peer_listen_port: Option<u16>,

    /// Resolved (`Ok`) or failed (`Err`) exactly once, the moment this
    /// connection's handshake completes or it closes beforehand. A
    /// `connect()` caller waiting specifically on this connection holds
    /// the matching receiver. The `Ok` payload is the peer's node id,
    /// the actor id published at the port we dialed (`ActorId::INVALID`
    /// if none), and that actor's declared interface signatures
    /// (`spec.md` §6: `connect(connection, port) → (node, actor_handle,
    /// sigs) | error`).
    pub handshake_promise:
        Option<oneshot::Sender<Result<(NodeId, ActorId, Vec<String>), BaspError>>>,

    pub inbound_types: TypeTable,
    pub outbound_types: TypeTable,

    pub last_seen: Instant,

    /// Frames to write, consumed by this connection's writer task.
    pub write_tx: mpsc::UnboundedSender<Vec<u8>>,

    /// Whether this connection was accepted (inbound) or opened by a
    /// local `connect()` call (outbound). Purely diagnostic; BASP
    /// itself is symmetric once the handshake completes.
    pub inbound: bool,
}

impl ConnectionContext {
    pub fn new(
        handle: ConnectionHandle,
        peer_addr: SocketAddr,
        write_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound: bool,
    ) -> Self {
        Self {
            handle,
            phase: ParserPhase::Fresh,
            peer_addr,
            peer_node: None,
            peer_listen_port: None,
            handshake_promise: None,
            inbound_types: TypeTable::new(),
            outbound_types: TypeTable::new(),
            last_seen: Instant::now(),
            write_tx,
            inbound,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: std::time::Duration) -> bool {
        !timeout.is_zero() && self.last_seen.elapsed() > timeout
    }

    pub fn handshake_complete(&self) -> bool {
        self.peer_node.is_some()
    }

    /// Resolve the connection's handshake promise, if a caller is
    /// waiting on one. A connection only ever resolves its promise
    /// once; a second call is a no-op (the sender was already consumed).
    pub fn resolve_handshake(&mut self, result: Result<(NodeId, ActorId, Vec<String>), BaspError>) {
        if let Some(promise) = self.handshake_promise.take() {
            let _ = promise.send(result);
        }
    }

    pub fn send_frame(&self, bytes: Vec<u8>) -> Result<(), BaspError> {
        self.write_tx.send(bytes).map_err(|_| BaspError::BrokerGone)
    }
}
