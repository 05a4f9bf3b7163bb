// BASP network layer — identifiers, wire constants, and small shared types.
//
// # Design goals
//
// 1. **Bit-exact wire format.** Every fixed-width field here is encoded in
//    network byte order so two independently-built nodes can interoperate.
// 2. **Bounded memory.** Header and string fields carry explicit size caps;
//    a malformed or hostile peer cannot force unbounded allocation before
//    the codec has validated a length prefix.
//
// # Non-goals
//
// Encryption, authentication, and flow control beyond what TCP already
// gives us are handled elsewhere (or not at all) — see `SPEC_FULL.md`.

use std::fmt;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Size in bytes of the host fingerprint embedded in a [`NodeId`].
pub const FINGERPRINT_SIZE: usize = 20;

/// Size in bytes of the fixed frame header (see `codec.rs`).
pub const HEADER_SIZE: usize = 1 + 1 + 4 + 8 + 4 + 4;

/// Upper bound on a single frame's payload. Guards against a peer sending
/// a bogus length prefix that would otherwise force a multi-gigabyte
/// allocation before we've validated anything.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on any length-prefixed string on the wire (type names,
/// interface signatures).
pub const MAX_STRING_SIZE: usize = 64 * 1024;

/// Upper bound on the number of interface-signature strings carried in a
/// handshake payload.
pub const MAX_SIGNATURES: usize = 4096;

/// Default heartbeat interval when the caller does not configure one
/// explicitly but still wants liveness checking.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Default connection timeout when heartbeats are disabled.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Multiplier applied to the heartbeat interval to derive a default
/// connection timeout when one isn't configured explicitly.
pub const CONNECTION_TIMEOUT_HEARTBEAT_FACTOR: u64 = 3;

/// Number of low actor ids reserved for named, well-known receivers
/// (`spawn_server`, `config_server`, ...). These live at the *top* of the
/// `u32` range so they never collide with a node's locally-assigned actor
/// ids, which start at 1 and count up.
pub const NAMED_RECEIVER_RANGE: std::ops::RangeInclusive<u32> = (u32::MAX - 15)..=u32::MAX;

/// Actor ids reserved for this crate's own ephemeral helper actors (the
/// connection helper of `spec.md` §4.6), sitting just below the named
/// receiver range so neither space can collide with a node's own
/// locally-assigned actor ids or with each other.
pub const HELPER_ACTOR_RANGE: std::ops::RangeInclusive<u32> = (u32::MAX - 271)..=(u32::MAX - 16);

// =============================================================================
// NODE IDENTIFIER
// =============================================================================

/// Process-unique identity of one node participating in the distributed
/// actor system: a stable host fingerprint plus the process id that
/// created it. Totally ordered so it can key a `BTreeMap`/`HashMap`
/// indifferently and so two nodes can deterministically break ties
/// (see the routing table's indirect-route tie-break).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub fingerprint: [u8; FINGERPRINT_SIZE],
    pub process_id: u32,
}

impl NodeId {
    /// The distinguished invalid/absent node id.
    pub const fn none() -> Self {
        Self {
            fingerprint: [0u8; FINGERPRINT_SIZE],
            process_id: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::none()
    }

    /// Derive a node id for the running process. Hashes the hostname
    /// together with a per-process random salt; unlike CAF's root-UUID
    /// scheme this doesn't try to survive process restarts on the same
    /// host, which is fine because nothing here persists state across
    /// restarts (see `SPEC_FULL.md` §6, "Persisted state: none").
    pub fn local() -> Self {
        use std::hash::{Hash, Hasher};

        let hostname = hostname_best_effort();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hostname.hash(&mut hasher);
        rand::random::<u64>().hash(&mut hasher);
        let h1 = hasher.finish();
        rand::random::<u64>().hash(&mut hasher);
        let h2 = hasher.finish();

        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        fingerprint[0..8].copy_from_slice(&h1.to_be_bytes());
        fingerprint[8..16].copy_from_slice(&h2.to_be_bytes());
        fingerprint[16..20].copy_from_slice(&rand::random::<u32>().to_be_bytes());

        Self {
            fingerprint,
            process_id: std::process::id(),
        }
    }
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(")?;
        for b in &self.fingerprint[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..@{})", self.process_id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// ACTOR IDENTIFIER
// =============================================================================

/// Process-local actor identity. `0` is never a valid actor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(pub u32);

impl ActorId {
    pub const INVALID: ActorId = ActorId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn is_named_receiver(&self) -> bool {
        NAMED_RECEIVER_RANGE.contains(&self.0)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

/// Well-known receivers addressed by name rather than by per-process
/// actor id. Resolved to a reserved [`ActorId`] at the top of the id
/// space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NamedReceiver {
    SpawnServer,
    ConfigServer,
}

impl NamedReceiver {
    pub fn actor_id(self) -> ActorId {
        match self {
            NamedReceiver::SpawnServer => ActorId(u32::MAX),
            NamedReceiver::ConfigServer => ActorId(u32::MAX - 1),
        }
    }

    pub fn from_actor_id(id: ActorId) -> Option<Self> {
        match id.0 {
            x if x == u32::MAX => Some(NamedReceiver::SpawnServer),
            x if x == u32::MAX - 1 => Some(NamedReceiver::ConfigServer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NamedReceiver::SpawnServer => "spawn_server",
            NamedReceiver::ConfigServer => "config_server",
        }
    }
}

// =============================================================================
// OPAQUE HANDLES
// =============================================================================

/// Opaque token identifying one bidirectional byte stream, minted by the
/// broker's connection registrar (standing in for the I/O multiplexer's
/// connection handle, which is an external collaborator here).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnectionHandle(pub u64);

/// Opaque token identifying one listening endpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AcceptHandle(pub u64);

/// Reason a remote actor's local proxy was torn down, or a connection/
/// node was lost. Mirrors the error taxonomy in `error.rs` for the
/// subset of reasons that travel as a local "exit value" rather than as
/// a caller-facing [`crate::net::error::BaspError`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal remote termination with an application-supplied code.
    Normal(u32),
    /// Proxy terminated without a reason (`spec.md` §7, `unknown`).
    Unknown,
    /// A route vanished while a request from/through this actor was in
    /// flight.
    RemoteLinkUnreachable,
    /// The connection/node was lost to a protocol violation.
    ProtocolError(String),
    /// The connection/node was lost to a heartbeat timeout.
    ConnectionTimeout,
}

impl ExitReason {
    /// The 64-bit reason code carried on the wire by a `down_message`
    /// (`spec.md` §4.4 item 6 / §6). `0` always means "unknown" on
    /// decode, so every non-`Normal` reason also encodes as `0` — the
    /// peer only ever needs to know "why" when it was a clean,
    /// application-supplied exit.
    pub fn code(&self) -> u64 {
        match self {
            ExitReason::Normal(code) => *code as u64,
            _ => 0,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal(code) => write!(f, "normal({code})"),
            ExitReason::Unknown => write!(f, "unknown"),
            ExitReason::RemoteLinkUnreachable => write!(f, "remote_link_unreachable"),
            ExitReason::ProtocolError(msg) => write!(f, "protocol_error({msg})"),
            ExitReason::ConnectionTimeout => write!(f, "connection_timeout"),
        }
    }
}
