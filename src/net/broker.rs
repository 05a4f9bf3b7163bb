//! The broker (`spec.md` §4.5): a single cooperative event loop owning
//! every piece of shared state — routing table, proxy registry,
//! connection contexts, and the local-actor registrations it forwards
//! dispatches to. Everything outside this task talks to it through
//! [`BrokerHandle`], which is just a clone of an `mpsc::Sender`; that
//! channel is this crate's rendering of CAF's in-loop dispatch
//! primitive (`SPEC_FULL.md` §5).
//!
//! Per-connection reader tasks decode frames but never touch broker
//! state directly — they forward `(header, payload)` pairs back over
//! the same command channel, so a connection's final `ConnectionClosed`
//! is strictly ordered after every frame that connection produced
//! (both come from the same task, serialized onto the same channel).
//! That ordering guarantee is what lets this design skip CAF's
//! self-enqueue trick for flushing in-flight frames before a close.

use crate::local::{LocalMailbox, LocalSignal};
use crate::net::codec::{Header, OutboundPayload, PayloadBag, TypeId};
use crate::net::config::NetConfig;
use crate::net::context::{ConnectionContext, ParserPhase};
use crate::net::error::{BaspError, Result};
use crate::net::helper;
use crate::net::instance::{BaspInstance, Callee, DispatchTarget};
use crate::net::proxy::{ProxyDropped, ProxyRegistry};
use crate::net::routing::{AddDirectResult, RoutingTable};
use crate::net::types::{
    ActorId, AcceptHandle, ConnectionHandle, ExitReason, HEADER_SIZE, HELPER_ACTOR_RANGE,
    NamedReceiver, NodeId,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// The outcome of a successful handshake as handed back to a `connect()`
/// caller (`spec.md` §6: `connect(connection, port) → (node, actor_handle,
/// sigs) | error`): the peer's node id, the actor published at the port
/// we dialed (`ActorId::INVALID` if none), and its declared interface
/// signatures.
pub type HandshakeOutcome = (NodeId, ActorId, Vec<String>);

/// Diagnostic events surfaced to whoever spawned the broker, independent
/// of any particular local actor registration.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Listening { accept: AcceptHandle, port: u16 },
    ConnectionEstablished { node: NodeId },
    ConnectionLost { node: NodeId, reason: ExitReason },
    Error { message: String },
}

/// Everything an external caller can ask the broker to do, plus the
/// internal notices that feed the same loop (`spec.md` §4.5's acceptor/
/// connection/heartbeat events folded into one enum so the select loop
/// has a single source of truth).
pub enum BrokerCommand {
    NewConnection {
        stream: TcpStream,
        peer_addr: SocketAddr,
        inbound: bool,
        /// Which acceptor accepted this connection, so the server
        /// handshake can carry that acceptor's published actor and
        /// signatures. `None` for outbound connections.
        accept: Option<AcceptHandle>,
        reply: Option<oneshot::Sender<Result<HandshakeOutcome>>>,
    },
    IncomingFrame {
        handle: ConnectionHandle,
        header: Header,
        payload: Vec<u8>,
    },
    ConnectionClosed {
        handle: ConnectionHandle,
        reason: ExitReason,
    },
    Publish {
        actor: ActorId,
        port: u16,
        signatures: Vec<String>,
        mailbox: LocalMailbox,
        reply: oneshot::Sender<Result<AcceptHandle>>,
    },
    Unpublish {
        actor: ActorId,
        port: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<HandshakeOutcome>>,
    },
    Close {
        handle: ConnectionHandle,
    },
    RegisterLocalActor {
        actor: ActorId,
        mailbox: LocalMailbox,
    },
    Forward {
        source: ActorId,
        dest_node: NodeId,
        dest: DispatchTarget,
        operation_id: u64,
        payload: OutboundPayload,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Monitor {
        node: NodeId,
        actor: ActorId,
    },
    Demonitor {
        node: NodeId,
        actor: ActorId,
    },
    /// `spec.md` §4.5 `node_monitor`: `observer` wants to hear about the
    /// whole node going away, not just one proxy.
    NodeMonitor {
        node: NodeId,
        observer: ActorId,
    },
    NodeDemonitor {
        node: NodeId,
        observer: ActorId,
    },
    /// The explicit-parameter replacement for CAF's thread-local "last
    /// hop" (`SPEC_FULL.md` §4.4, design note in `spec.md` §9): the
    /// (external, not built here) user-payload codec calls this when it
    /// deserializes a remote node id it hadn't seen before while decoding
    /// a dispatch payload that arrived via `via`.
    NoteIndirectNode {
        via: NodeId,
        node: NodeId,
    },
    /// Mint an ephemeral actor id and mailbox for a connection helper
    /// (`spec.md` §4.6) so it can receive the config-server's reply to
    /// its own requests without needing a full local actor.
    AllocateHelperActor {
        reply: oneshot::Sender<(ActorId, mpsc::UnboundedReceiver<LocalSignal>)>,
    },
    UnregisterLocalActor {
        actor: ActorId,
    },
    /// A connection helper found a working address and asks the broker
    /// to adopt the already-open stream as a new direct connection.
    AdoptConnection {
        stream: TcpStream,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<HandshakeOutcome>>,
    },
    LocalDown {
        actor: ActorId,
        reason: ExitReason,
    },
    ProxyDropped(ProxyDropped),
    Tick,
    Shutdown,
}

/// A cheap, cloneable handle to a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<BrokerCommand>) -> Self {
        Self { tx }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<HandshakeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerCommand::Connect { addr, reply })
            .map_err(|_| BaspError::BrokerGone)?;
        rx.await.map_err(|_| BaspError::BrokerGone)?
    }

    pub async fn publish(
        &self,
        actor: ActorId,
        port: u16,
        signatures: Vec<String>,
        mailbox: LocalMailbox,
    ) -> Result<AcceptHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerCommand::Publish {
                actor,
                port,
                signatures,
                mailbox,
                reply,
            })
            .map_err(|_| BaspError::BrokerGone)?;
        rx.await.map_err(|_| BaspError::BrokerGone)?
    }

    pub async fn unpublish(&self, actor: ActorId, port: u16) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerCommand::Unpublish { actor, port, reply })
            .map_err(|_| BaspError::BrokerGone)?;
        rx.await.map_err(|_| BaspError::BrokerGone)?
    }

    pub fn register_local_actor(&self, actor: ActorId, mailbox: LocalMailbox) -> Result<()> {
        self.tx
            .send(BrokerCommand::RegisterLocalActor { actor, mailbox })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub async fn forward(
        &self,
        source: ActorId,
        dest_node: NodeId,
        dest: DispatchTarget,
        operation_id: u64,
        payload: OutboundPayload,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerCommand::Forward {
                source,
                dest_node,
                dest,
                operation_id,
                payload,
                reply: Some(reply),
            })
            .map_err(|_| BaspError::BrokerGone)?;
        rx.await.map_err(|_| BaspError::BrokerGone)?
    }

    pub fn monitor(&self, node: NodeId, actor: ActorId) -> Result<()> {
        self.tx
            .send(BrokerCommand::Monitor { node, actor })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub fn demonitor(&self, node: NodeId, actor: ActorId) -> Result<()> {
        self.tx
            .send(BrokerCommand::Demonitor { node, actor })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub fn node_monitor(&self, node: NodeId, observer: ActorId) -> Result<()> {
        self.tx
            .send(BrokerCommand::NodeMonitor { node, observer })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub fn node_demonitor(&self, node: NodeId, observer: ActorId) -> Result<()> {
        self.tx
            .send(BrokerCommand::NodeDemonitor { node, observer })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub fn note_indirect_node(&self, via: NodeId, node: NodeId) -> Result<()> {
        self.tx
            .send(BrokerCommand::NoteIndirectNode { via, node })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub async fn allocate_helper_actor(&self) -> Result<(ActorId, mpsc::UnboundedReceiver<LocalSignal>)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerCommand::AllocateHelperActor { reply })
            .map_err(|_| BaspError::BrokerGone)?;
        rx.await.map_err(|_| BaspError::BrokerGone)
    }

    pub fn unregister_local_actor(&self, actor: ActorId) -> Result<()> {
        self.tx
            .send(BrokerCommand::UnregisterLocalActor { actor })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub async fn adopt_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<HandshakeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerCommand::AdoptConnection { stream, addr, reply })
            .map_err(|_| BaspError::BrokerGone)?;
        rx.await.map_err(|_| BaspError::BrokerGone)?
    }

    pub fn local_down(&self, actor: ActorId, reason: ExitReason) -> Result<()> {
        self.tx
            .send(BrokerCommand::LocalDown { actor, reason })
            .map_err(|_| BaspError::BrokerGone)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(BrokerCommand::Shutdown);
    }
}

struct Acceptor {
    actor: ActorId,
    port: u16,
    signatures: Vec<String>,
}

/// All shared state for one node (`spec.md` §3).
pub struct Broker {
    this_node: NodeId,
    config: NetConfig,
    instance: BaspInstance,

    routes: RoutingTable,
    proxies: ProxyRegistry,
    contexts: HashMap<ConnectionHandle, ConnectionContext>,
    next_handle: u64,

    acceptors: HashMap<AcceptHandle, Acceptor>,
    next_accept_handle: u64,

    local_registry: HashMap<ActorId, LocalMailbox>,
    /// Remote peers monitoring a local actor (`spec.md` §4.5 "monitor").
    monitors_of_local: HashMap<ActorId, HashSet<NodeId>>,
    /// Local actor ids wanting to hear about an entire node going down
    /// (`spec.md` §3 "Node-observer set"). Resolved to a mailbox through
    /// `local_registry` at notify time.
    node_observers: HashMap<NodeId, HashSet<ActorId>>,
    /// Nodes for which a connection helper has already been spawned, so
    /// a second indirect-route sighting doesn't start a duplicate race
    /// to the same peer (`spec.md` §4.6).
    helpers_spawned: HashSet<NodeId>,
    next_helper_actor: u32,

    cmd_tx: mpsc::UnboundedSender<BrokerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<BrokerCommand>,
    proxy_drop_tx: mpsc::UnboundedSender<ProxyDropped>,

    event_tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl Broker {
    /// Spawn a broker task and hand back a handle to it plus its
    /// diagnostic event stream.
    pub fn spawn(
        this_node: NodeId,
        config: NetConfig,
    ) -> (BrokerHandle, mpsc::UnboundedReceiver<BrokerEvent>, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let proxy_drop_tx = cmd_tx.clone();
        // Re-wrap: ProxyState needs an mpsc::UnboundedSender<ProxyDropped>,
        // not <BrokerCommand>, so route drops through a small relay task.
        let (drop_tx, mut drop_rx) = mpsc::unbounded_channel::<ProxyDropped>();
        tokio::spawn(async move {
            while let Some(dropped) = drop_rx.recv().await {
                if proxy_drop_tx.send(BrokerCommand::ProxyDropped(dropped)).is_err() {
                    break;
                }
            }
        });

        let handle = BrokerHandle { tx: cmd_tx.clone() };
        let mut broker = Broker {
            this_node,
            config,
            instance: BaspInstance::new(this_node),
            routes: RoutingTable::new(),
            proxies: ProxyRegistry::new(),
            contexts: HashMap::new(),
            next_handle: 1,
            acceptors: HashMap::new(),
            next_accept_handle: 1,
            local_registry: HashMap::new(),
            monitors_of_local: HashMap::new(),
            node_observers: HashMap::new(),
            helpers_spawned: HashSet::new(),
            next_helper_actor: *HELPER_ACTOR_RANGE.start(),
            cmd_tx,
            cmd_rx,
            proxy_drop_tx: drop_tx,
            event_tx,
        };
        let join = tokio::spawn(async move {
            broker.run().await;
        });
        (handle, event_rx, join)
    }

    async fn run(&mut self) {
        let mut heartbeat = self.config.heartbeat_enabled().then(|| {
            let mut interval = tokio::time::interval(self.config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            let tick = async {
                match heartbeat.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                        true
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd, BrokerCommand::Shutdown) {
                                debug!("broker shutting down");
                                break;
                            }
                            self.handle_command(cmd).await;
                        }
                        None => break,
                    }
                }
                _ = tick => {
                    self.handle_command(BrokerCommand::Tick).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::NewConnection { stream, peer_addr, inbound, accept, reply } => {
                self.on_new_connection(stream, peer_addr, inbound, accept, reply);
            }
            BrokerCommand::IncomingFrame { handle, header, payload } => {
                self.on_incoming_frame(handle, header, payload);
            }
            BrokerCommand::ConnectionClosed { handle, reason } => {
                self.on_connection_closed(handle, reason);
            }
            BrokerCommand::Publish { actor, port, signatures, mailbox, reply } => {
                let _ = reply.send(self.on_publish(actor, port, signatures, mailbox).await);
            }
            BrokerCommand::Unpublish { actor, port, reply } => {
                let _ = reply.send(self.on_unpublish(actor, port));
            }
            BrokerCommand::Connect { addr, reply } => {
                self.on_connect(addr, reply).await;
            }
            BrokerCommand::Close { handle } => {
                self.close_connection(handle, ExitReason::Normal(0));
            }
            BrokerCommand::RegisterLocalActor { actor, mailbox } => {
                self.local_registry.insert(actor, mailbox);
            }
            BrokerCommand::Forward { source, dest_node, dest, operation_id, payload, reply } => {
                let result = self.on_forward(source, dest_node, dest, operation_id, payload);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            BrokerCommand::Monitor { node, actor } => self.on_monitor(node, actor),
            BrokerCommand::Demonitor { node, actor } => self.on_demonitor(node, actor),
            BrokerCommand::NodeMonitor { node, observer } => self.on_node_monitor(node, observer),
            BrokerCommand::NodeDemonitor { node, observer } => {
                if let Some(observers) = self.node_observers.get_mut(&node) {
                    observers.remove(&observer);
                }
            }
            BrokerCommand::NoteIndirectNode { via, node } => self.learned_new_indirect_node(via, node),
            BrokerCommand::AllocateHelperActor { reply } => {
                let actor = self.allocate_helper_actor();
                let (mailbox, rx) = LocalMailbox::channel();
                self.local_registry.insert(actor, mailbox);
                let _ = reply.send((actor, rx));
            }
            BrokerCommand::UnregisterLocalActor { actor } => {
                self.local_registry.remove(&actor);
            }
            BrokerCommand::AdoptConnection { stream, addr, reply } => {
                self.on_new_connection(stream, addr, false, None, Some(reply));
            }
            BrokerCommand::LocalDown { actor, reason } => self.on_local_down(actor, reason),
            BrokerCommand::ProxyDropped(dropped) => self.on_proxy_dropped(dropped),
            BrokerCommand::Tick => self.on_tick(),
            BrokerCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    // -------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------

    fn on_new_connection(
        &mut self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        inbound: bool,
        accept: Option<AcceptHandle>,
        reply: Option<oneshot::Sender<Result<HandshakeOutcome>>>,
    ) {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;

        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(read_loop(handle, read_half, self.cmd_tx.clone()));
        tokio::spawn(write_loop(write_half, write_rx));

        let mut ctx = ConnectionContext::new(handle, peer_addr, write_tx, inbound);
        ctx.phase = ParserPhase::AwaitHeader;
        if let Some(reply) = reply {
            ctx.handshake_promise = Some(reply);
        }

        let greeting = if inbound {
            let acceptor = accept.and_then(|a| self.acceptors.get(&a));
            let (published_actor, signatures) = acceptor
                .map(|a| (a.actor, a.signatures.clone()))
                .unwrap_or((ActorId::INVALID, Vec::new()));
            self.instance
                .write_server_handshake(self.config.listen_port, published_actor, &signatures)
        } else {
            self.instance.write_client_handshake(&[])
        };
        let _ = ctx.send_frame(greeting);

        info!(?handle, %peer_addr, inbound, "connection opened");
        self.contexts.insert(handle, ctx);
    }

    fn on_incoming_frame(&mut self, handle: ConnectionHandle, header: Header, payload: Vec<u8>) {
        let (peer_node, mut inbound_types) = {
            let Some(ctx) = self.contexts.get_mut(&handle) else {
                return;
            };
            ctx.touch();
            ctx.phase = ParserPhase::AwaitHeader;
            (ctx.peer_node, std::mem::take(&mut ctx.inbound_types))
        };

        let instance = BaspInstance::new(self.this_node);
        let result = instance.handle(handle, &header, &payload, peer_node, &mut inbound_types, self);
        if let Some(ctx) = self.contexts.get_mut(&handle) {
            ctx.inbound_types = inbound_types;
        }

        if let Err(err) = result {
            warn!(?handle, %err, "closing connection on protocol error");
            self.close_connection(handle, ExitReason::ProtocolError(err.to_string()));
        }
    }

    fn on_connection_closed(&mut self, handle: ConnectionHandle, reason: ExitReason) {
        self.close_connection(handle, reason);
    }

    fn close_connection(&mut self, handle: ConnectionHandle, reason: ExitReason) {
        let Some(mut ctx) = self.contexts.remove(&handle) else {
            return;
        };
        ctx.resolve_handshake(Err(BaspError::DisconnectDuringHandshake));

        let Some(node) = self.routes.erase_direct(handle) else {
            return;
        };
        info!(?node, %reason, "node disconnected");

        for actor in self.proxies.erase_node(node) {
            self.notify_down(node, actor, reason.clone());
        }
        self.notify_node_observers(node, reason.clone());
        self.helpers_spawned.remove(&node);
        let _ = self.event_tx.send(BrokerEvent::ConnectionLost { node, reason });
    }

    /// Broadcast a remote proxy's termination to every locally-registered
    /// actor. The broker only knows `(node, actor)` and which mailboxes
    /// exist — which local actors actually monitored or linked to this
    /// particular proxy is link-graph state that belongs to the (external,
    /// out-of-scope) local actor runtime, so every registrant is told and
    /// left to decide whether the notification is relevant to it.
    fn notify_down(&self, node: NodeId, actor: ActorId, reason: ExitReason) {
        for mailbox in self.local_registry.values() {
            let _ = mailbox.send(LocalSignal::Down { node, actor, reason: reason.clone() });
        }
    }

    fn notify_node_observers(&mut self, node: NodeId, reason: ExitReason) {
        for observer in self.node_observers.remove(&node).unwrap_or_default() {
            if let Some(mailbox) = self.local_registry.get(&observer) {
                let _ = mailbox.send(LocalSignal::NodeDown { node, reason: reason.clone() });
            }
        }
    }

    fn allocate_helper_actor(&mut self) -> ActorId {
        let id = self.next_helper_actor;
        self.next_helper_actor = if id >= *HELPER_ACTOR_RANGE.end() {
            *HELPER_ACTOR_RANGE.start()
        } else {
            id + 1
        };
        ActorId(id)
    }

    fn on_node_monitor(&mut self, node: NodeId, observer: ActorId) {
        self.node_observers.entry(node).or_default().insert(observer);
        if self.routes.lookup(node).is_none() {
            if let Some(mailbox) = self.local_registry.get(&observer) {
                let _ = mailbox.send(LocalSignal::NodeDown {
                    node,
                    reason: ExitReason::RemoteLinkUnreachable,
                });
            }
        }
    }

    // -------------------------------------------------------------------
    // Publish / unpublish / connect
    // -------------------------------------------------------------------

    async fn on_publish(
        &mut self,
        actor: ActorId,
        port: u16,
        signatures: Vec<String>,
        mailbox: LocalMailbox,
    ) -> Result<AcceptHandle> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(BaspError::BindFailure)?;
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let accept_handle = AcceptHandle(self.next_accept_handle);
        self.next_accept_handle += 1;
        self.acceptors
            .insert(accept_handle, Acceptor { actor, port: bound_port, signatures });
        self.local_registry.insert(actor, mailbox);

        tokio::spawn(accept_loop(listener, accept_handle, self.cmd_tx.clone()));
        let _ = self.event_tx.send(BrokerEvent::Listening { accept: accept_handle, port: bound_port });
        Ok(accept_handle)
    }

    /// `spec.md` §3: "an attempted unpublish with a mismatched actor is a
    /// no-op and signals failure" — the acceptor at `port` is only closed
    /// when `actor` is the one actually published there.
    fn on_unpublish(&mut self, actor: ActorId, port: u16) -> Result<()> {
        let handle = self
            .acceptors
            .iter()
            .find(|(_, acceptor)| acceptor.port == port && acceptor.actor == actor)
            .map(|(handle, _)| *handle);
        match handle {
            Some(handle) => {
                self.acceptors.remove(&handle);
                Ok(())
            }
            None => Err(BaspError::NoActorPublishedAtPort(port)),
        }
    }

    async fn on_connect(&mut self, addr: SocketAddr, reply: oneshot::Sender<Result<HandshakeOutcome>>) {
        match TcpStream::connect(addr).await {
            Ok(stream) => self.on_new_connection(stream, addr, false, None, Some(reply)),
            Err(err) => {
                let _ = reply.send(Err(BaspError::CannotConnect(err)));
            }
        }
    }

    // -------------------------------------------------------------------
    // Forwarding / monitors
    // -------------------------------------------------------------------

    fn on_forward(
        &mut self,
        source: ActorId,
        dest_node: NodeId,
        dest: DispatchTarget,
        operation_id: u64,
        payload: OutboundPayload,
    ) -> Result<()> {
        let route = self
            .routes
            .lookup(dest_node)
            .ok_or(BaspError::RemoteLinkUnreachable(dest_node))?;
        let ctx = self
            .contexts
            .get_mut(&route.handle)
            .ok_or(BaspError::RemoteLinkUnreachable(dest_node))?;
        let frames = self.instance.write_dispatch(
            &mut ctx.outbound_types,
            source,
            dest,
            operation_id,
            &payload,
        );
        for frame in frames {
            ctx.send_frame(frame)?;
        }
        Ok(())
    }

    fn on_monitor(&mut self, node: NodeId, actor: ActorId) {
        if let Some(route) = self.routes.lookup(node) {
            if let Some(ctx) = self.contexts.get(&route.handle) {
                let frame = self.instance.write_monitor(actor);
                let _ = ctx.send_frame(frame);
            }
        }
    }

    fn on_demonitor(&mut self, node: NodeId, actor: ActorId) {
        if let Some(route) = self.routes.lookup(node) {
            if let Some(ctx) = self.contexts.get(&route.handle) {
                let frame = self.instance.write_demonitor(actor);
                let _ = ctx.send_frame(frame);
            }
        }
    }

    fn on_local_down(&mut self, actor: ActorId, reason: ExitReason) {
        self.local_registry.remove(&actor);
        let Some(watchers) = self.monitors_of_local.remove(&actor) else {
            return;
        };
        let reason_code = reason.code();
        for node in watchers {
            if let Some(route) = self.routes.lookup(node) {
                if let Some(ctx) = self.contexts.get(&route.handle) {
                    let frame = self.instance.write_down(actor, reason_code);
                    let _ = ctx.send_frame(frame);
                }
            }
        }
    }

    fn on_proxy_dropped(&mut self, dropped: ProxyDropped) {
        if !dropped.actor.is_valid() {
            return;
        }
        // `spec.md` §4.3: losing the last local reference emits a
        // demonitor_message toward the owner, if a route still exists,
        // then erases the registry entry.
        if let Some(route) = self.routes.lookup(dropped.node) {
            if let Some(ctx) = self.contexts.get(&route.handle) {
                let frame = self.instance.write_demonitor(dropped.actor);
                let _ = ctx.send_frame(frame);
            }
        }
        self.proxies.reap_if_dead(dropped.node, dropped.actor);
    }

    fn on_tick(&mut self) {
        let timeout = self.config.connection_timeout;
        let mut timed_out = Vec::new();
        for (handle, ctx) in self.contexts.iter() {
            if ctx.is_timed_out(timeout) {
                timed_out.push(*handle);
            } else {
                let frame = self.instance.write_heartbeat();
                let _ = ctx.send_frame(frame);
            }
        }
        for handle in timed_out {
            self.close_connection(handle, ExitReason::ConnectionTimeout);
        }
    }
}

impl Callee for Broker {
    fn finalize_handshake(
        &mut self,
        conn: ConnectionHandle,
        node: NodeId,
        published_actor: ActorId,
        signatures: Vec<String>,
    ) {
        if !self.contexts.contains_key(&conn) {
            return;
        }
        if node == self.this_node {
            warn!(?conn, "peer reported our own node id, closing");
            if let Some(ctx) = self.contexts.get_mut(&conn) {
                ctx.resolve_handshake(Err(BaspError::Protocol("self-connection".into())));
            }
            self.close_connection(conn, ExitReason::ProtocolError("self-connection".into()));
            return;
        }
        // Only resolve the handshake `Ok` once the route is actually
        // accepted — a duplicate direct connection resolves `Err` instead
        // so a `connect()` caller on the losing side doesn't see a false
        // success just before its connection is closed.
        match self.routes.add_direct(node, conn) {
            AddDirectResult::Added => {
                if let Some(ctx) = self.contexts.get_mut(&conn) {
                    ctx.peer_node = Some(node);
                    ctx.resolve_handshake(Ok((node, published_actor, signatures)));
                }
                info!(?node, ?conn, "direct route established");
                let _ = self.event_tx.send(BrokerEvent::ConnectionEstablished { node });
            }
            AddDirectResult::AlreadyExists => {
                // Both sides may have dialed each other at the same moment
                // (`spec.md` §4.2, scenario 4: simultaneous mutual connect).
                // Break the tie the same way on both ends without
                // coordinating: the socket that is this node's outbound leg
                // when `this_node < node`, or its inbound leg when
                // `this_node > node`, survives. That rule picks the same
                // physical socket from either peer's point of view, since
                // one end's outbound leg is the other end's inbound leg.
                let desired_inbound = self.this_node > node;
                let new_is_desired = self
                    .contexts
                    .get(&conn)
                    .map(|ctx| ctx.inbound == desired_inbound)
                    .unwrap_or(false);

                if new_is_desired {
                    if let Some(old_handle) = self.routes.lookup(node).map(|route| route.handle) {
                        self.routes.replace_direct(node, conn);
                        if let Some(ctx) = self.contexts.get_mut(&conn) {
                            ctx.peer_node = Some(node);
                            ctx.resolve_handshake(Ok((node, published_actor, signatures)));
                        }
                        info!(?node, ?conn, "direct route established, superseding duplicate");
                        // `node` was already reported established by
                        // whichever leg finished its handshake first; this
                        // is a socket swap under the same logical route,
                        // not a fresh connection, so it doesn't re-fire
                        // `ConnectionEstablished`.
                        self.close_connection(
                            old_handle,
                            ExitReason::ProtocolError("superseded by duplicate direct connection".into()),
                        );
                        return;
                    }
                }

                warn!(?node, ?conn, "duplicate direct connection, closing");
                if let Some(ctx) = self.contexts.get_mut(&conn) {
                    ctx.resolve_handshake(Err(BaspError::Protocol(
                        "duplicate direct connection".into(),
                    )));
                }
                self.close_connection(conn, ExitReason::ProtocolError("duplicate direct connection".into()));
            }
        }
    }

    fn learned_new_indirect_node(&mut self, via: NodeId, node: NodeId) {
        if self.routes.add_indirect(via, node) {
            debug!(?via, ?node, "learned indirect route");
            if self.config.enable_automatic_connections && self.helpers_spawned.insert(node) {
                let broker = BrokerHandle::from_sender(self.cmd_tx.clone());
                tokio::spawn(async move {
                    helper::run(broker, node, helper::AUTOCONNECT_TIMEOUT).await;
                });
            }
        }
    }

    fn deliver_dispatch(
        &mut self,
        conn: ConnectionHandle,
        last_hop: NodeId,
        source: ActorId,
        dest: DispatchTarget,
        operation_id: u64,
        payload: PayloadBag,
    ) {
        let to_actor = match dest {
            DispatchTarget::Actor(id) => id,
            DispatchTarget::Named(named) => named.actor_id(),
        };
        if let DispatchTarget::Named(NamedReceiver::SpawnServer | NamedReceiver::ConfigServer) = dest {
            debug!(?last_hop, ?to_actor, "dispatch to named receiver not handled by this crate");
            return;
        }

        // First sighting of this (node, actor) as a dispatch source mints
        // its proxy and tells the owner we're now monitoring it
        // (`spec.md` §3, §4.4 item 3).
        let (proxy, created) = if source.is_valid() {
            self.proxies.get_or_put(last_hop, source, self.proxy_drop_tx.clone())
        } else {
            (ProxyRegistry::anonymous(last_hop, self.proxy_drop_tx.clone()), false)
        };
        if created {
            let frame = self.instance.write_monitor(source);
            if let Some(ctx) = self.contexts.get(&conn) {
                let _ = ctx.send_frame(frame);
            }
        }

        if let Some(mailbox) = self.local_registry.get(&to_actor) {
            let _ = mailbox.send(LocalSignal::Dispatch {
                from_node: last_hop,
                from_actor: source,
                to_actor,
                operation_id,
                payload,
                sender_proxy: proxy,
            });
        } else {
            debug!(?to_actor, "dispatch to unregistered local actor dropped");
        }
    }

    fn deliver_monitor(&mut self, conn: ConnectionHandle, watched: ActorId) {
        let Some(node) = self.contexts.get(&conn).and_then(|c| c.peer_node) else {
            return;
        };
        // `spec.md` §4.4 item 4: if the watched actor is already gone,
        // answer immediately instead of registering a watch that will
        // never fire.
        if !self.local_registry.contains_key(&watched) {
            let frame = self.instance.write_down(watched, ExitReason::Unknown.code());
            if let Some(ctx) = self.contexts.get(&conn) {
                let _ = ctx.send_frame(frame);
            }
            return;
        }
        self.monitors_of_local.entry(watched).or_default().insert(node);
    }

    fn deliver_demonitor(&mut self, conn: ConnectionHandle, watched: ActorId) {
        let Some(node) = self.contexts.get(&conn).and_then(|c| c.peer_node) else {
            return;
        };
        if let Some(watchers) = self.monitors_of_local.get_mut(&watched) {
            watchers.remove(&node);
        }
    }

    fn deliver_down(&mut self, conn: ConnectionHandle, actor: ActorId, reason_code: u64) {
        let Some(node) = self.contexts.get(&conn).and_then(|c| c.peer_node) else {
            return;
        };
        let reason = if reason_code == 0 {
            ExitReason::Unknown
        } else {
            ExitReason::Normal(reason_code as u32)
        };
        if self.proxies.erase(node, actor) {
            self.notify_down(node, actor, reason);
        }
    }

    // `instance.handle` already registered this mapping in the
    // connection's inbound `TypeTable` before calling here; the broker
    // has nothing further to do with an inbound `add_type`.
    fn deliver_add_type(&mut self, _conn: ConnectionHandle, _type_id: TypeId, _name: String) {}

    fn protocol_violation(&mut self, conn: ConnectionHandle, message: String) {
        warn!(?conn, %message, "protocol violation");
    }
}

async fn read_loop(
    handle: ConnectionHandle,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    cmd_tx: mpsc::UnboundedSender<BrokerCommand>,
) {
    let mut header_buf = [0u8; HEADER_SIZE];
    loop {
        if let Err(err) = reader.read_exact(&mut header_buf).await {
            let reason = if err.kind() == std::io::ErrorKind::UnexpectedEof {
                ExitReason::Normal(0)
            } else {
                ExitReason::ProtocolError(err.to_string())
            };
            let _ = cmd_tx.send(BrokerCommand::ConnectionClosed { handle, reason });
            return;
        }
        let header = match Header::decode(&header_buf) {
            Ok(header) => header,
            Err(err) => {
                let _ = cmd_tx.send(BrokerCommand::ConnectionClosed {
                    handle,
                    reason: ExitReason::ProtocolError(err.to_string()),
                });
                return;
            }
        };
        let mut payload = vec![0u8; header.payload_len as usize];
        if !payload.is_empty() {
            if let Err(err) = reader.read_exact(&mut payload).await {
                let _ = cmd_tx.send(BrokerCommand::ConnectionClosed {
                    handle,
                    reason: ExitReason::ProtocolError(err.to_string()),
                });
                return;
            }
        }
        if cmd_tx
            .send(BrokerCommand::IncomingFrame { handle, header, payload })
            .is_err()
        {
            return;
        }
    }
}

async fn write_loop(mut writer: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    accept: AcceptHandle,
    cmd_tx: mpsc::UnboundedSender<BrokerCommand>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if cmd_tx
                    .send(BrokerCommand::NewConnection {
                        stream,
                        peer_addr,
                        inbound: true,
                        accept: Some(accept),
                        reply: None,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "accept failed");
                return;
            }
        }
    }
}
