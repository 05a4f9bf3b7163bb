//! BASP broker — standalone node binary.
//!
//! Starts a broker task listening on a local port, optionally dials a
//! list of peers on startup, and logs the broker's diagnostic event
//! stream until interrupted.

use basp_broker::net::broker::{Broker, BrokerEvent};
use basp_broker::net::config::NetConfig;
use basp_broker::net::types::NodeId;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "basp", version, about = "BASP broker node")]
struct Args {
    /// Listen port (0 asks the OS for an ephemeral port)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Peers to dial on startup (comma-separated host:port)
    #[arg(short, long)]
    connect: Option<String>,

    /// Heartbeat interval in seconds (0 disables heartbeating)
    #[arg(long, default_value = "0")]
    heartbeat_secs: u64,

    /// Spawn a connection helper on the first indirect route learned to
    /// a node, attempting to upgrade it to a direct connection
    #[arg(long)]
    enable_automatic_connections: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("basp=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = NetConfig {
        listen_port: args.port,
        enable_automatic_connections: args.enable_automatic_connections,
        ..Default::default()
    };
    if args.heartbeat_secs > 0 {
        config = config.with_heartbeat(Duration::from_secs(args.heartbeat_secs));
    }

    let this_node = NodeId::local();
    info!("════════════════════════════════════════════════════════════");
    info!("  BASP broker v{} — node {:?}", VERSION, this_node);
    info!("════════════════════════════════════════════════════════════");

    let (broker, mut events, join) = Broker::spawn(this_node, config);

    let dial_targets: Vec<SocketAddr> = args
        .connect
        .map(|s| {
            s.split(',')
                .filter_map(|part| {
                    let part = part.trim();
                    match part.parse::<SocketAddr>() {
                        Ok(addr) => Some(addr),
                        Err(err) => {
                            warn!(%part, %err, "ignoring unparseable peer address");
                            None
                        }
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    for addr in dial_targets {
        let broker = broker.clone();
        tokio::spawn(async move {
            match broker.connect(addr).await {
                Ok((node, actor, sigs)) => {
                    info!(%addr, ?node, ?actor, ?sigs, "connected to peer")
                }
                Err(err) => error!(%addr, %err, "failed to connect to peer"),
            }
        });
    }

    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Listening { accept, port } => {
                    info!(?accept, port, "listening");
                }
                BrokerEvent::ConnectionEstablished { node } => {
                    info!(?node, "direct route established");
                }
                BrokerEvent::ConnectionLost { node, reason } => {
                    warn!(?node, %reason, "direct route lost");
                }
                BrokerEvent::Error { message } => {
                    error!(%message, "broker error");
                }
            }
        }
    });

    info!("BASP broker running. Waiting for connections...");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    broker.shutdown();
    let _ = join.await;
    events_task.abort();
}
