//! Wire framing & codec (`spec.md` §4.1, §6).
//!
//! Every frame on the wire is a fixed-size [`Header`] followed by exactly
//! `header.payload_len` payload bytes (which may be zero). The parser
//! this module exists to serve is a two-state machine per connection
//! (see `context.rs`): request the header, decode it, then either
//! request the payload or — if `payload_len == 0` — process the frame
//! immediately and go back to awaiting the next header.
//!
//! The header's general-purpose fields (`operation_id`, `source_actor`,
//! `dest_actor`) carry different meanings depending on `kind`; each
//! `write_*` / the matching arm of [`decode_dispatch_like`] documents
//! its own layout so a decoder never has to guess.

use crate::net::error::BaspError;
use crate::net::types::{
    ActorId, NodeId, FINGERPRINT_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_SIGNATURES,
    MAX_STRING_SIZE,
};

// =============================================================================
// MESSAGE KIND
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    ServerHandshake = 0,
    ClientHandshake = 1,
    Dispatch = 2,
    Monitor = 3,
    Demonitor = 4,
    Down = 5,
    Heartbeat = 6,
    /// Control frame mapping a small integer to a fully-qualified type
    /// name for the sender's outbound type table (`spec.md` §4.1).
    AddType = 7,
}

impl TryFrom<u8> for MessageKind {
    type Error = BaspError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageKind::ServerHandshake,
            1 => MessageKind::ClientHandshake,
            2 => MessageKind::Dispatch,
            3 => MessageKind::Monitor,
            4 => MessageKind::Demonitor,
            5 => MessageKind::Down,
            6 => MessageKind::Heartbeat,
            7 => MessageKind::AddType,
            other => return Err(BaspError::Protocol(format!("unknown message kind {other}"))),
        })
    }
}

// =============================================================================
// HEADER
// =============================================================================

/// Bit 0 of the flags byte: destination is a named receiver id, not a
/// per-process actor id.
pub const FLAG_DEST_NAMED: u8 = 0b0000_0001;

/// Fixed-size frame header. 1-byte kind, 1-byte flags, 4-byte payload
/// length, 8-byte operation id, 4-byte source actor id, 4-byte
/// destination actor id — all big-endian, `HEADER_SIZE` bytes total.
#[derive(Clone, Debug)]
pub struct Header {
    pub kind: MessageKind,
    pub flags: u8,
    pub payload_len: u32,
    pub operation_id: u64,
    pub source_actor: ActorId,
    pub dest_actor: ActorId,
}

impl Header {
    pub fn dest_is_named(&self) -> bool {
        self.flags & FLAG_DEST_NAMED != 0
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: MessageKind::Heartbeat,
            flags: 0,
            payload_len: 0,
            operation_id: 0,
            source_actor: ActorId::INVALID,
            dest_actor: ActorId::INVALID,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind as u8);
        buf.push(self.flags);
        buf.extend_from_slice(&self.payload_len.to_be_bytes());
        buf.extend_from_slice(&self.operation_id.to_be_bytes());
        buf.extend_from_slice(&self.source_actor.0.to_be_bytes());
        buf.extend_from_slice(&self.dest_actor.0.to_be_bytes());
    }

    /// Decode a header from exactly `HEADER_SIZE` bytes. Rejects unknown
    /// kinds and oversize payload lengths as malformed (`spec.md` §4.1:
    /// "Malformed headers ... cause the broker to close the connection
    /// with a protocol-error reason").
    pub fn decode(bytes: &[u8]) -> Result<Self, BaspError> {
        if bytes.len() != HEADER_SIZE {
            return Err(BaspError::Protocol(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let kind = MessageKind::try_from(bytes[0])?;
        let flags = bytes[1];
        let payload_len = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(BaspError::Protocol(format!(
                "oversize payload: {payload_len} > {MAX_PAYLOAD_SIZE}"
            )));
        }
        let operation_id = u64::from_be_bytes(bytes[6..14].try_into().unwrap());
        let source_actor = ActorId(u32::from_be_bytes(bytes[14..18].try_into().unwrap()));
        let dest_actor = ActorId(u32::from_be_bytes(bytes[18..22].try_into().unwrap()));
        Ok(Self {
            kind,
            flags,
            payload_len,
            operation_id,
            source_actor,
            dest_actor,
        })
    }
}

// =============================================================================
// PRIMITIVE ENCODING
// =============================================================================

pub fn encode_node_id(buf: &mut Vec<u8>, node: &NodeId) {
    buf.extend_from_slice(&node.fingerprint);
    buf.extend_from_slice(&node.process_id.to_be_bytes());
}

pub fn encode_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Cursor over a decoded payload. Every read is bounds-checked against
/// the remaining slice; there is no framing escape character, so an
/// out-of-bounds read always means a malformed frame, never "wait for
/// more bytes" (`spec.md` §4.1).
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BaspError> {
        if self.remaining() < n {
            return Err(BaspError::Protocol("payload truncated".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, BaspError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BaspError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, BaspError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], BaspError> {
        self.take(n)
    }

    pub fn read_node_id(&mut self) -> Result<NodeId, BaspError> {
        let fp = self.take(FINGERPRINT_SIZE)?;
        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(fp);
        let process_id = self.read_u32()?;
        Ok(NodeId {
            fingerprint,
            process_id,
        })
    }

    pub fn read_string(&mut self) -> Result<String, BaspError> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_SIZE {
            return Err(BaspError::Protocol(format!(
                "string too large: {len} > {MAX_STRING_SIZE}"
            )));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BaspError::Protocol("string is not valid utf-8".into()))
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, BaspError> {
        let count = self.read_u32()? as usize;
        if count > MAX_SIGNATURES {
            return Err(BaspError::Protocol(format!(
                "too many signature strings: {count} > {MAX_SIGNATURES}"
            )));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }
}

pub fn encode_string_list(buf: &mut Vec<u8>, items: &[String]) {
    buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        encode_string(buf, item);
    }
}

// =============================================================================
// CONNECTIVITY REPLY (connection helper, spec.md §4.6)
// =============================================================================

/// The body of a `get("basp.default-connectivity-tcp")` reply, carried
/// inside a [`PayloadBag`] entry as this crate's own minimal convention
/// for the optional automatic-mesh feature. `spec.md` leaves the config
/// server's wire contract to the (external) user-payload codec; this is
/// the narrowest self-consistent encoding that lets one instance of this
/// crate talk to another without inventing a real config service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityReply {
    pub port: u16,
    pub addrs: Vec<std::net::IpAddr>,
}

/// Reserved [`TypeId`] for a [`ConnectivityReply`] payload entry. Not
/// part of a connection's negotiated type table — the connection helper
/// and the (external) config server it talks to agree on this value out
/// of band, the same way `spec.md` §3 calls named receivers "well-known".
pub const CONNECTIVITY_REPLY_TYPE: TypeId = 1;

impl ConnectivityReply {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&(self.addrs.len() as u32).to_be_bytes());
        for addr in &self.addrs {
            match addr {
                std::net::IpAddr::V4(v4) => {
                    buf.push(4);
                    buf.extend_from_slice(&v4.octets());
                }
                std::net::IpAddr::V6(v6) => {
                    buf.push(6);
                    buf.extend_from_slice(&v6.octets());
                }
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, BaspError> {
        let mut r = PayloadReader::new(data);
        let port = r.read_u16()?;
        let count = r.read_u32()? as usize;
        let mut addrs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let tag = r.read_u8()?;
            let addr = match tag {
                4 => {
                    let bytes = r.read_bytes(4)?;
                    std::net::IpAddr::V4(std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
                }
                6 => {
                    let bytes = r.read_bytes(16)?;
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(bytes);
                    std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets))
                }
                other => return Err(BaspError::Protocol(format!("unknown address tag {other}"))),
            };
            addrs.push(addr);
        }
        Ok(Self { port, addrs })
    }
}

// =============================================================================
// HANDSHAKE PAYLOADS
// =============================================================================

/// Payload shared by both handshake frames: the emitter's node id plus
/// its declared interface signatures. The server side additionally
/// carries its listen port (`spec.md` §6).
#[derive(Clone, Debug)]
pub struct HandshakePayload {
    pub node: NodeId,
    pub listen_port: Option<u16>,
    pub signatures: Vec<String>,
}

impl HandshakePayload {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_node_id(buf, &self.node);
        if let Some(port) = self.listen_port {
            buf.extend_from_slice(&port.to_be_bytes());
        }
        encode_string_list(buf, &self.signatures);
    }

    pub fn decode(data: &[u8], has_port: bool) -> Result<Self, BaspError> {
        let mut r = PayloadReader::new(data);
        let node = r.read_node_id()?;
        let listen_port = if has_port {
            Some(r.read_u16()?)
        } else {
            None
        };
        let signatures = r.read_string_list()?;
        Ok(Self {
            node,
            listen_port,
            signatures,
        })
    }
}

// =============================================================================
// TYPED DISPATCH PAYLOAD
// =============================================================================

/// A small integer identifying a type within one connection's outbound
/// or inbound type table (`spec.md` §4.1). `0` is reserved.
pub type TypeId = u32;

/// A decoded dispatch payload: an ordered bag of `(type id, opaque
/// bytes)` pairs. This crate never interprets the bytes — the user
/// payload codec is an external collaborator (`SPEC_FULL.md` §4.4a); it
/// only maintains the per-connection name↔id table that lets the bytes
/// be addressed by a compact integer instead of a repeated type name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadBag(pub Vec<(TypeId, Vec<u8>)>);

impl PayloadBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, type_id: TypeId, value: Vec<u8>) {
        self.0.push((type_id, value));
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        for (type_id, value) in &self.0 {
            buf.extend_from_slice(&type_id.to_be_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, BaspError> {
        let mut r = PayloadReader::new(data);
        let mut entries = Vec::new();
        while !r.is_empty() {
            let type_id = r.read_u32()?;
            let len = r.read_u32()? as usize;
            let value = r.read_bytes(len)?.to_vec();
            entries.push((type_id, value));
        }
        Ok(Self(entries))
    }
}

/// One value a caller wants to send before a connection (and therefore a
/// per-connection [`TypeTable`]) is known (`spec.md` §4.1). `Named`
/// carries the value's fully-qualified type name, which
/// `BaspInstance::write_dispatch` compacts into a per-connection
/// [`TypeId`] — emitting an `add_type` frame the first time the
/// connection sees that name. `Raw` bypasses the table entirely for a
/// type id both ends already agree on out of band (this crate's own
/// `CONNECTIVITY_REPLY_TYPE` convention for the connection helper).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundEntry {
    Named(String, Vec<u8>),
    Raw(TypeId, Vec<u8>),
}

/// An ordered list of [`OutboundEntry`] values making up one dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundPayload(pub Vec<OutboundEntry>);

impl OutboundPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_named(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.0.push(OutboundEntry::Named(name.into(), value));
    }

    pub fn push_raw(&mut self, type_id: TypeId, value: Vec<u8>) {
        self.0.push(OutboundEntry::Raw(type_id, value));
    }
}

/// Per-connection type-name dictionaries (`spec.md` §3, §4.1). Ids are
/// assigned monotonically starting at 1 in each direction; id `0` is
/// reserved and never assigned.
#[derive(Default, Debug)]
pub struct TypeTable {
    outbound_by_name: std::collections::HashMap<String, TypeId>,
    inbound_by_id: std::collections::HashMap<TypeId, String>,
    next_outbound_id: TypeId,
}

impl TypeTable {
    pub fn new() -> Self {
        Self {
            next_outbound_id: 1,
            ..Default::default()
        }
    }

    /// Look up (or assign) the outbound id for `name`. The returned bool
    /// is `true` exactly when `name` was new to this connection, telling
    /// the caller it must emit an `add_type` frame (`BaspInstance::write_add_type`)
    /// before any dispatch frame using the returned id.
    pub fn outbound_id_for(&mut self, name: &str) -> (TypeId, bool) {
        if let Some(id) = self.outbound_by_name.get(name) {
            return (*id, false);
        }
        let id = self.next_outbound_id;
        self.next_outbound_id += 1;
        self.outbound_by_name.insert(name.to_string(), id);
        (id, true)
    }

    pub fn register_inbound(&mut self, id: TypeId, name: String) {
        self.inbound_by_id.insert(id, name);
    }

    pub fn resolve_inbound(&self, id: TypeId) -> Option<&str> {
        self.inbound_by_id.get(&id).map(|s| s.as_str())
    }

    pub fn decode_add_type(data: &[u8]) -> Result<(TypeId, String), BaspError> {
        let mut r = PayloadReader::new(data);
        let id = r.read_u32()?;
        let name = r.read_string()?;
        Ok((id, name))
    }
}
