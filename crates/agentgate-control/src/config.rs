//! Control plane configuration

use agentgate_broker::DEFAULT_NEGOTIATION_TIMEOUT;
use agentgate_proto::IceServer;
use std::time::Duration;
use tracing::error;

/// Overrides the statistics report interval, in milliseconds
pub const AGENT_STAT_INTERVAL_ENV: &str = "AGENTGATE_AGENT_STAT_INTERVAL";

/// Default heartbeat tick of agent connections
pub const DEFAULT_UPDATE_FREQUENCY: Duration = Duration::from_secs(3);

/// Default statistics report interval
pub const DEFAULT_STAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// An agent whose last heartbeat is older than this is disconnected
    pub agent_inactive_disconnect_timeout: Duration,
    /// Heartbeat tick; also the fencing check period
    pub agent_connection_update_frequency: Duration,
    /// Interval between statistics report requests
    pub agent_stat_interval: Duration,
    /// Handed to the dialing side of every negotiation
    pub ice_servers: Vec<IceServer>,
    /// Time allowed for a direct path before relaying; zero always relays
    pub relay_acceptance_wait: Duration,
    /// How long a tunnel waits for the agent to answer its offer
    pub negotiation_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::with_update_frequency(DEFAULT_UPDATE_FREQUENCY)
    }
}

impl ControlConfig {
    /// Defaults with the inactivity timeout derived from the heartbeat tick
    pub fn with_update_frequency(frequency: Duration) -> Self {
        Self {
            agent_inactive_disconnect_timeout: frequency * 2,
            agent_connection_update_frequency: frequency,
            agent_stat_interval: DEFAULT_STAT_INTERVAL,
            ice_servers: Vec::new(),
            relay_acceptance_wait: Duration::ZERO,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    /// Apply environment overrides, keeping defaults for unparseable values
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(interval) = env_millis(AGENT_STAT_INTERVAL_ENV) {
            self.agent_stat_interval = interval;
        }
        self
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let value = std::env::var(name).ok()?;
    match parse_millis(&value) {
        Some(duration) => Some(duration),
        None => {
            error!(env = name, value = %value, "Invalid duration override, keeping default");
            None
        }
    }
}

/// Parse a positive whole number of milliseconds
pub fn parse_millis(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}
