//! Connection helper (`spec.md` §4.6): spawned by the broker the first
//! time it learns an indirect route to a node, when automatic mesh
//! formation is enabled. It asks that node's config server for its
//! default TCP connectivity, tries each candidate address in turn, and
//! on the first successful connect hands the open stream back to the
//! broker to adopt as a new direct route. If nothing works inside the
//! timeout it gives up; the broker tolerates a helper that never
//! reports back.

use crate::net::broker::BrokerHandle;
use crate::net::codec::{ConnectivityReply, OutboundPayload, CONNECTIVITY_REPLY_TYPE};
use crate::net::instance::DispatchTarget;
use crate::net::types::{NamedReceiver, NodeId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long the helper keeps trying before giving up on `node`. CAF's
/// `connection_helper` actor uses the same ten-minute bound
/// (`original_source/libcaf_io/caf/io/connection_helper.cpp`).
pub const AUTOCONNECT_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-address connect attempt bound, so one unreachable candidate can't
/// eat the whole budget.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The key this crate's connection helper requests from a peer's config
/// server, mirroring CAF's own `"basp.default-connectivity-tcp"` get.
const CONNECTIVITY_KEY: &str = "basp.default-connectivity-tcp";

pub async fn run(broker: BrokerHandle, node: NodeId, timeout: Duration) {
    let deadline = Instant::now() + timeout;

    let (helper_actor, mut inbox) = match broker.allocate_helper_actor().await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(?node, %err, "connection helper could not allocate an actor id");
            return;
        }
    };

    let mut request = OutboundPayload::new();
    let mut key_bytes = Vec::new();
    crate::net::codec::encode_string(&mut key_bytes, CONNECTIVITY_KEY);
    // `CONNECTIVITY_REPLY_TYPE` is a reserved id both ends already agree
    // on out of band, so it bypasses the per-connection type table.
    request.push_raw(CONNECTIVITY_REPLY_TYPE, key_bytes);

    if let Err(err) = broker
        .forward(
            helper_actor,
            node,
            DispatchTarget::Named(NamedReceiver::ConfigServer),
            0,
            request,
        )
        .await
    {
        debug!(?node, %err, "connection helper could not reach config server, giving up");
        let _ = broker.unregister_local_actor(helper_actor);
        return;
    }

    let reply = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(?node, "connection helper timed out waiting for config server reply");
            let _ = broker.unregister_local_actor(helper_actor);
            return;
        }
        let signal = match tokio::time::timeout(remaining, inbox.recv()).await {
            Ok(Some(signal)) => signal,
            Ok(None) | Err(_) => {
                warn!(?node, "connection helper timed out waiting for config server reply");
                let _ = broker.unregister_local_actor(helper_actor);
                return;
            }
        };
        if let crate::local::LocalSignal::Dispatch { payload, .. } = signal {
            match payload.0.first() {
                Some((CONNECTIVITY_REPLY_TYPE, bytes)) => match ConnectivityReply::decode(bytes) {
                    Ok(reply) => break reply,
                    Err(err) => {
                        warn!(?node, %err, "connection helper got a malformed connectivity reply");
                        let _ = broker.unregister_local_actor(helper_actor);
                        return;
                    }
                },
                _ => continue,
            }
        }
        // A stray Down/NodeDown signal on this mailbox isn't ours to act
        // on; keep waiting for the reply we actually asked for.
    };

    let candidates: Vec<SocketAddr> = reply
        .addrs
        .into_iter()
        .map(|ip| SocketAddr::new(ip, reply.port))
        .collect();

    for addr in candidates {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let dial_budget = DIAL_TIMEOUT.min(remaining);
        match tokio::time::timeout(dial_budget, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                match broker.adopt_connection(stream, addr).await {
                    Ok((adopted, ..)) => {
                        debug!(?node, %addr, ?adopted, "connection helper established direct route");
                    }
                    Err(err) => {
                        warn!(?node, %addr, %err, "broker refused to adopt helper's connection");
                    }
                }
                let _ = broker.unregister_local_actor(helper_actor);
                return;
            }
            Ok(Err(err)) => {
                debug!(?node, %addr, %err, "connection helper dial failed, trying next address");
            }
            Err(_) => {
                debug!(?node, %addr, "connection helper dial timed out, trying next address");
            }
        }
    }

    warn!(?node, "connection helper exhausted every candidate address");
    let _ = broker.unregister_local_actor(helper_actor);
}
