//! Logical stream kinds carried in the stream-open frame
//!
//! Every stream opened over a tunnel announces its purpose with a
//! [`StreamKind`]. The kind is serialized as JSON into the payload of the
//! `Open` frame, so free-form values such as terminal commands never need
//! delimiter escaping.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Protocol tag for the built-in SSH server
pub const PROTOCOL_SSH: &str = "ssh";
/// Protocol tag for reconnecting terminals
pub const PROTOCOL_RECONNECTING_PTY: &str = "reconnecting-pty";
/// Protocol tag for arbitrary dials from inside the workspace
pub const PROTOCOL_DIAL: &str = "dial";
/// Protocol tag for signaling streams
pub const PROTOCOL_NEGOTIATE: &str = "negotiate";
/// Protocol tag for the statistics reporting stream
pub const PROTOCOL_STATS_REPORT: &str = "stats-report";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid dial target {target:?}: {reason}")]
    InvalidDialTarget { target: String, reason: String },

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Invalid stream header: {0}")]
    InvalidStreamHeader(#[from] serde_json::Error),
}

/// Network scheme of a dial stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialScheme {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl DialScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialScheme::Tcp => "tcp",
            DialScheme::Tcp4 => "tcp4",
            DialScheme::Tcp6 => "tcp6",
            DialScheme::Udp => "udp",
            DialScheme::Udp4 => "udp4",
            DialScheme::Udp6 => "udp6",
            DialScheme::Unix => "unix",
        }
    }

    /// UDP schemes request unordered delivery
    pub fn is_udp(&self) -> bool {
        matches!(self, DialScheme::Udp | DialScheme::Udp4 | DialScheme::Udp6)
    }
}

impl FromStr for DialScheme {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(DialScheme::Tcp),
            "tcp4" => Ok(DialScheme::Tcp4),
            "tcp6" => Ok(DialScheme::Tcp6),
            "udp" => Ok(DialScheme::Udp),
            "udp4" => Ok(DialScheme::Udp4),
            "udp6" => Ok(DialScheme::Udp6),
            "unix" => Ok(DialScheme::Unix),
            other => Err(ProtoError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for DialScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purpose of a logical stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum StreamKind {
    /// Built-in SSH server
    Ssh,
    /// Terminal session that survives client reconnects
    ReconnectingPty {
        session_id: Uuid,
        height: u16,
        width: u16,
        /// Optional command, empty starts the default shell
        #[serde(default)]
        command: String,
    },
    /// Dial an address from inside the workspace
    Dial { scheme: DialScheme, address: String },
    /// Signaling exchange relayed by the control plane
    Negotiate,
    /// Periodic statistics reporting
    StatsReport,
}

impl StreamKind {
    /// Build a dial kind from a network name and an address
    ///
    /// Unix sockets take a filesystem path, every other network a `host:port`.
    pub fn dial(network: &str, address: &str) -> Result<Self, ProtoError> {
        let scheme: DialScheme = network.parse()?;
        if address.is_empty() {
            return Err(ProtoError::InvalidDialTarget {
                target: address.to_string(),
                reason: "address is empty".to_string(),
            });
        }
        Ok(StreamKind::Dial {
            scheme,
            address: address.to_string(),
        })
    }

    /// Parse a URL-shaped dial target such as `tcp://127.0.0.1:22` or
    /// `unix:///var/run/app.sock`
    pub fn parse_dial_target(target: &str) -> Result<Self, ProtoError> {
        let invalid = |reason: &str| ProtoError::InvalidDialTarget {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(target).map_err(|e| invalid(&e.to_string()))?;
        let scheme: DialScheme = url.scheme().parse()?;

        let address = if scheme == DialScheme::Unix {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(invalid("missing socket path"));
            }
            path.to_string()
        } else {
            let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
            let port = url.port().ok_or_else(|| invalid("missing port"))?;
            format!("{}:{}", host, port)
        };

        Ok(StreamKind::Dial { scheme, address })
    }

    /// Render a dial kind back into its URL-shaped target
    pub fn dial_target(&self) -> Option<String> {
        match self {
            StreamKind::Dial { scheme, address } if *scheme == DialScheme::Unix => {
                Some(format!("unix://{}", address))
            }
            StreamKind::Dial { scheme, address } => Some(format!("{}://{}", scheme, address)),
            _ => None,
        }
    }

    /// Protocol tag used for statistics accounting
    pub fn protocol(&self) -> &'static str {
        match self {
            StreamKind::Ssh => PROTOCOL_SSH,
            StreamKind::ReconnectingPty { .. } => PROTOCOL_RECONNECTING_PTY,
            StreamKind::Dial { .. } => PROTOCOL_DIAL,
            StreamKind::Negotiate => PROTOCOL_NEGOTIATE,
            StreamKind::StatsReport => PROTOCOL_STATS_REPORT,
        }
    }

    /// Whether the stream asks for unordered delivery
    pub fn unordered(&self) -> bool {
        matches!(self, StreamKind::Dial { scheme, .. } if scheme.is_udp())
    }

    /// Serialize into an `Open` frame payload
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from an `Open` frame payload
    pub fn decode(header: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(header)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_target() {
        let kind = StreamKind::parse_dial_target("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(
            kind,
            StreamKind::Dial {
                scheme: DialScheme::Tcp,
                address: "127.0.0.1:8080".to_string()
            }
        );
        assert!(!kind.unordered());
        assert_eq!(kind.protocol(), PROTOCOL_DIAL);
    }

    #[test]
    fn test_parse_udp_target_is_unordered() {
        let kind = StreamKind::parse_dial_target("udp://10.0.0.2:53").unwrap();
        assert!(kind.unordered());
    }

    #[test]
    fn test_parse_ipv6_target() {
        let kind = StreamKind::parse_dial_target("tcp6://[::1]:22").unwrap();
        assert_eq!(kind.dial_target().unwrap(), "tcp6://[::1]:22");
    }

    #[test]
    fn test_parse_unix_target() {
        let kind = StreamKind::parse_dial_target("unix:///var/run/docker.sock").unwrap();
        assert_eq!(
            kind,
            StreamKind::Dial {
                scheme: DialScheme::Unix,
                address: "/var/run/docker.sock".to_string()
            }
        );
        assert_eq!(kind.dial_target().unwrap(), "unix:///var/run/docker.sock");
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        assert!(matches!(
            StreamKind::parse_dial_target("sctp://127.0.0.1:1"),
            Err(ProtoError::UnsupportedNetwork(_))
        ));
        assert!(StreamKind::parse_dial_target("tcp://127.0.0.1").is_err());
        assert!(StreamKind::parse_dial_target("unix://").is_err());
        assert!(StreamKind::parse_dial_target("not a url").is_err());
    }

    #[test]
    fn test_command_with_delimiters_survives_header() {
        let kind = StreamKind::ReconnectingPty {
            session_id: Uuid::new_v4(),
            height: 24,
            width: 80,
            command: "bash -c 'echo a:b:c'".to_string(),
        };

        let decoded = StreamKind::decode(&kind.encode().unwrap()).unwrap();
        assert_eq!(decoded, kind);
        assert_eq!(decoded.protocol(), PROTOCOL_RECONNECTING_PTY);
    }

    #[test]
    fn test_header_tag_names() {
        let json = String::from_utf8(StreamKind::Ssh.encode().unwrap().to_vec()).unwrap();
        assert_eq!(json, r#"{"protocol":"ssh"}"#);
    }
}
