//! Error taxonomy for the BASP broker (`spec.md` §7).
//!
//! These are recovery *kinds*, not exception classes: every variant maps
//! to a documented recovery action in the broker (close + purge, bounce a
//! pending request, surface to a caller) rather than being fatal to the
//! process.

use crate::net::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum BaspError {
    /// Malformed frame, duplicate direct connection, or unexpected
    /// handshake order. Recovery: close the connection, purge routing and
    /// proxy state for the node, notify observers.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection closed before the peer's server handshake arrived.
    /// Surfaced to the pending `connect` caller.
    #[error("disconnected during handshake")]
    DisconnectDuringHandshake,

    /// `last_seen` exceeded `connection_timeout`. Same recovery as
    /// `Protocol`.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// A route to `node` disappeared while a request was in flight; the
    /// request is bounced with this reason.
    #[error("remote link unreachable: {0:?}")]
    RemoteLinkUnreachable(NodeId),

    /// A listen attempt failed (e.g. port busy). Surfaced to the
    /// `publish` caller; no broker state changes.
    #[error("bind failed: {0}")]
    BindFailure(#[source] std::io::Error),

    /// A socket connect attempt failed. Surfaced to the `connect` caller.
    #[error("cannot connect: {0}")]
    CannotConnect(#[source] std::io::Error),

    /// `unpublish` was called with an actor that doesn't match the one
    /// published at that port.
    #[error("no actor published at port {0}")]
    NoActorPublishedAtPort(u16),

    /// A remote actor's proxy was torn down without an explicit reason.
    #[error("remote proxy terminated without reason")]
    Unknown,

    /// The broker's command channel is gone (broker shut down).
    #[error("broker is shutting down")]
    BrokerGone,
}

pub type Result<T> = std::result::Result<T, BaspError>;
