//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// First message written by the agent on a dial stream
///
/// An empty `error` means the remote dial succeeded and raw bytes follow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialResponse {
    #[serde(default)]
    pub error: String,
}

impl DialResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Client input for a reconnecting terminal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectingPtyRequest {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub width: u16,
}

/// Sent by the control plane to ask an agent for its statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatsReportRequest {}

/// Counters for a single protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStatsReport {
    /// Currently open connections
    #[serde(rename = "num_comms")]
    pub num_conns: i64,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

impl ProtocolStatsReport {
    pub fn is_zero(&self) -> bool {
        self.num_conns == 0 && self.rx_bytes == 0 && self.tx_bytes == 0
    }
}

/// Returned by the agent for each report request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatsReportResponse {
    pub num_comms: i64,
    #[serde(default)]
    pub protocol_stats: HashMap<String, ProtocolStatsReport>,
}

impl AgentStatsReportResponse {
    /// Whether any protocol saw connections or traffic since the last report
    pub fn has_activity(&self) -> bool {
        self.protocol_stats.values().any(|p| !p.is_zero())
    }
}

/// Connectivity status of an agent, derived from its connection timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Connecting => "connecting",
            AgentStatus::Connected => "connected",
            AgentStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network identity announced by an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node public key used for addressing
    pub key: String,
    /// Separate public key used for discovery
    pub disco_key: String,
    /// Preferred relay region
    #[serde(default)]
    pub preferred_relay: i32,
    /// Measured latency per relay region, in seconds
    #[serde(default)]
    pub relay_latency: HashMap<String, f64>,
}

/// A single day in the daily active users series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DauEntry {
    pub date: chrono::DateTime<chrono::Utc>,
    pub daus: i64,
}

/// Daily active users, oldest day first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDausResponse {
    pub entries: Vec<DauEntry>,
}
