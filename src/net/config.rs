//! Broker configuration (`spec.md` §6, "Configuration options").

use crate::net::types::{
    CONNECTION_TIMEOUT_HEARTBEAT_FACTOR, DEFAULT_CONNECTION_TIMEOUT_SECS,
};
use std::time::Duration;

/// Tunables for one broker instance. Deliberately not persisted anywhere
/// (`spec.md` §6: no persisted state).
#[derive(Clone, Debug)]
pub struct NetConfig {
    /// TCP port this node's acceptor listens on. `0` asks the OS for an
    /// ephemeral port (used by the round-trip-ping scenario in
    /// `spec.md` §8).
    pub listen_port: u16,

    /// Whether the broker spawns a connection helper (§4.6) the first
    /// time it learns an indirect route, attempting to upgrade it to a
    /// direct connection and form a mesh. Default `false`.
    pub enable_automatic_connections: bool,

    /// Interval between heartbeat frames sent on every open connection.
    /// `Duration::ZERO` disables heartbeating entirely (default).
    pub heartbeat_interval: Duration,

    /// How long a connection may go without a received frame before the
    /// broker closes it with `connection_timeout`. Defaults to three
    /// times `heartbeat_interval` when heartbeating is enabled, or a
    /// flat 30s otherwise.
    pub connection_timeout: Duration,

    /// Whether helper actors (the connection helper) run detached from
    /// the broker's own task instead of sharing it. This crate always
    /// spawns helpers as separate tokio tasks; the flag only controls
    /// whether they're tracked for graceful shutdown.
    pub attach_utility_actors: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            enable_automatic_connections: false,
            heartbeat_interval: Duration::ZERO,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            attach_utility_actors: false,
        }
    }
}

impl NetConfig {
    /// Build a config with a heartbeat interval and a connection timeout
    /// derived from it (`spec.md` §6: "default implementation-defined,
    /// e.g., 3x heartbeat").
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.connection_timeout = interval * CONNECTION_TIMEOUT_HEARTBEAT_FACTOR as u32;
        self
    }

    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }
}
