//! Request and response bodies

use serde::{Deserialize, Serialize};

/// Standard body of every non-2xx response, and of acknowledgements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationError>,
}

impl Response {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// A rejected request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub detail: String,
}

/// `?agent_id=` on agent-authenticated routes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentQuery {
    pub agent_id: Option<String>,
}

/// Query parameters of the reconnecting terminal route
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PtyQuery {
    pub reconnect: Option<String>,
    pub height: Option<String>,
    pub width: Option<String>,
    pub command: Option<String>,
}

/// Terminal geometry used when the client sends none, or garbage
pub const DEFAULT_PTY_GEOMETRY: u16 = 80;

impl PtyQuery {
    pub fn height(&self) -> u16 {
        parse_geometry(self.height.as_deref())
    }

    pub fn width(&self) -> u16 {
        parse_geometry(self.width.as_deref())
    }

    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or_default()
    }
}

fn parse_geometry(value: Option<&str>) -> u16 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PTY_GEOMETRY)
}
