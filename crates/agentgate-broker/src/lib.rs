//! Signaling and peer connection broker
//!
//! Lets the control plane (dialing side) and a NAT-bound agent (answering
//! side) negotiate a transport without either having a routable address to
//! the other. Signals travel over a shared publish/subscribe bus:
//!
//! ```text
//! client ──Negotiate stream──> proxy_listen ──bus──> proxy_dial ──Negotiate stream──> agent
//!   dial()                                                                     answer()
//! ```
//!
//! Once the offer/answer exchange completes, the peers either connect
//! directly to a host candidate or fall back to a relay colocated with the
//! control plane.

pub mod peer;
pub mod proxy;
pub mod pubsub;
pub mod relay;

pub use peer::{answer, dial, DialOptions, PeerConn, DEFAULT_NEGOTIATION_TIMEOUT};
pub use proxy::{proxy_dial, proxy_listen, ProxyDialer, PEERBROKER_TOPIC};
pub use pubsub::{
    agent_prefixed, strip_agent_prefix, Handler, MemoryPubsub, Pubsub, Subscription,
    AGENT_PREFIX_LEN,
};
pub use relay::{
    PipeRelayDialer, RelayConfig, RelayDialer, RelayHello, RelayRequest, RelayServer,
    TcpRelayDialer,
};

use agentgate_proto::CodecError;
use agentgate_transport::TransportError;
use std::net::IpAddr;
use thiserror::Error;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Relay allocation quota exceeded for {0}")]
    QuotaExceeded(IpAddr),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,
}

pub type BrokerResult<T> = Result<T, BrokerError>;
