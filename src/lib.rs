pub mod local;
pub mod net;

pub use local::{LocalMailbox, LocalSignal};
pub use net::broker::{Broker, BrokerCommand, BrokerEvent, BrokerHandle, HandshakeOutcome};
pub use net::config::NetConfig;
pub use net::error::{BaspError, Result};
pub use net::instance::DispatchTarget;
pub use net::types::{
    ActorId, AcceptHandle, ConnectionHandle, ExitReason, NamedReceiver, NodeId,
};
