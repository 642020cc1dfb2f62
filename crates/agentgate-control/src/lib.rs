//! Control plane for agent tunnels
//!
//! - [`listen`]: the agent-facing heartbeat connection and build fencing
//! - [`plane::ControlPlane::open_agent_tunnel`]: client-side tunnel opener
//! - [`AgentConn`]: logical streams over an established tunnel
//! - [`report`]: periodic statistics collection
//! - [`node`]: network identity updates relayed over the bus

pub mod agent_conn;
pub mod config;
pub mod listen;
pub mod liveness;
pub mod node;
pub mod plane;
pub mod report;
pub mod task_tracker;

pub use agent_conn::{write_dial_response, AgentConn};
pub use config::ControlConfig;
pub use listen::{prepare_agent_listen, serve_agent_listen, ListenTarget};
pub use liveness::{derive_status, AgentView, FencedBuilds};
pub use node::{post_agent_node, serve_agent_node, TAILNET_TOPIC};
pub use plane::ControlPlane;
pub use report::{
    resolve_report_target, respond_stats_reports, serve_stats_reports, ReportTarget,
};
pub use task_tracker::TaskTracker;

use agentgate_broker::BrokerError;
use agentgate_proto::{AgentStatus, CodecError, ProtoError};
use agentgate_relay_db::StoreError;
use agentgate_transport::{CloseCode, TransportError};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while accepting agent connections
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Agent {agent_id} is trying to connect from non-latest build {build_id}")]
    OutdatedBuild { agent_id: Uuid, build_id: Uuid },

    #[error("Invalid agent record: {0}")]
    InvalidAgent(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Errors raised while opening a tunnel or a stream on it
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Agent isn't connected! Status: {0}.")]
    AgentNotConnected(AgentStatus),

    #[error("Tunnel is closed")]
    Closed,

    #[error("Remote dial error: {0}")]
    RemoteDial(String),

    #[error("Negotiate: {0}")]
    Negotiation(BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed => TunnelError::Closed,
            e => TunnelError::Transport(e),
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// How a long-lived agent connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseStatus {
    pub fn normal() -> Self {
        Self {
            code: CloseCode::Normal,
            reason: String::new(),
        }
    }

    pub fn going_away() -> Self {
        Self {
            code: CloseCode::GoingAway,
            reason: String::new(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CloseCode::Abnormal,
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self {
            code: CloseCode::InternalError,
            reason: reason.into(),
        }
    }
}
