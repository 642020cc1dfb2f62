//! Agent connectivity derived from stored timestamps
//!
//! Status is never stored. It is recomputed from `first_connected_at`,
//! `last_connected_at` and `disconnected_at` every time it is read, with the
//! rules applied in order:
//!
//! 1. never connected: `connecting`
//! 2. disconnected after the last heartbeat: `disconnected`
//! 3. last heartbeat older than the inactivity timeout: `disconnected`
//! 4. otherwise: `connected`

use agentgate_proto::AgentStatus;
use agentgate_relay_db::entities::workspace_agent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::{ControlError, ControlResult};

/// Derive the status of an agent at `now`
///
/// An absent `last_connected_at` is treated as infinitely old.
pub fn derive_status(
    first_connected_at: Option<DateTime<Utc>>,
    last_connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    inactive_timeout: Duration,
) -> AgentStatus {
    if first_connected_at.is_none() {
        return AgentStatus::Connecting;
    }

    let Some(last) = last_connected_at else {
        return AgentStatus::Disconnected;
    };

    if matches!(disconnected_at, Some(disconnected) if disconnected > last) {
        return AgentStatus::Disconnected;
    }

    // A heartbeat from the future (clock skew) is not inactivity
    match (now - last).to_std() {
        Ok(elapsed) if elapsed > inactive_timeout => AgentStatus::Disconnected,
        _ => AgentStatus::Connected,
    }
}

/// Status of a stored agent row
pub fn agent_status(
    agent: &workspace_agent::Model,
    now: DateTime<Utc>,
    inactive_timeout: Duration,
) -> AgentStatus {
    derive_status(
        agent.first_connected_at,
        agent.last_connected_at,
        agent.disconnected_at,
        now,
        inactive_timeout,
    )
}

/// Agent as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    pub name: String,
    pub resource_id: Uuid,
    pub architecture: String,
    pub operating_system: String,
    pub startup_script: String,
    pub environment_variables: HashMap<String, String>,
    pub directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disco_public_key: Option<String>,
    pub preferred_relay: i32,
    pub relay_latency: HashMap<String, f64>,
}

impl AgentView {
    pub fn from_model(
        agent: workspace_agent::Model,
        now: DateTime<Utc>,
        inactive_timeout: Duration,
    ) -> ControlResult<Self> {
        let status = agent_status(&agent, now, inactive_timeout);

        let environment_variables = match agent.environment_variables.as_deref() {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ControlError::InvalidAgent(format!("environment variables: {}", e))
            })?,
            None => HashMap::new(),
        };
        let relay_latency = match agent.relay_latency.as_deref() {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| ControlError::InvalidAgent(format!("relay latency: {}", e)))?,
            None => HashMap::new(),
        };

        Ok(Self {
            id: agent.id,
            created_at: agent.created_at,
            updated_at: agent.updated_at,
            first_connected_at: agent.first_connected_at,
            last_connected_at: agent.last_connected_at,
            disconnected_at: agent.disconnected_at,
            status,
            name: agent.name,
            resource_id: agent.resource_id,
            architecture: agent.architecture,
            operating_system: agent.operating_system,
            startup_script: agent.startup_script.unwrap_or_default(),
            environment_variables,
            directory: agent.directory,
            node_public_key: agent.node_public_key,
            disco_public_key: agent.disco_public_key,
            preferred_relay: agent.preferred_relay,
            relay_latency,
        })
    }
}

/// (agent, build) pairs torn down because the build was superseded
///
/// Membership is permanent for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct FencedBuilds {
    pairs: Arc<Mutex<HashSet<(Uuid, Uuid)>>>,
}

impl FencedBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fence(&self, agent_id: Uuid, build_id: Uuid) {
        if let Ok(mut pairs) = self.pairs.lock() {
            pairs.insert((agent_id, build_id));
        }
    }

    pub fn is_fenced(&self, agent_id: Uuid, build_id: Uuid) -> bool {
        self.pairs
            .lock()
            .map(|pairs| pairs.contains(&(agent_id, build_id)))
            .unwrap_or(false)
    }
}
