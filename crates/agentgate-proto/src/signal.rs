//! Signaling messages exchanged while negotiating a peer connection

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server a peer may use to gather candidates or relay traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Directly reachable address of the peer
    Host,
    /// Address allocated on a relay
    Relay,
}

/// Transport address a peer can be reached at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub address: String,
}

impl Candidate {
    pub fn host(address: impl Into<String>) -> Self {
        Self {
            kind: CandidateKind::Host,
            address: address.into(),
        }
    }
}

/// Description of one side of a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Identifies the negotiation; doubles as the relay allocation id
    pub session_id: Uuid,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Transport chosen by the offering side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "lowercase")]
pub enum SelectedPath {
    Direct { address: String },
    Relay,
}

/// Messages written on a signaling stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    Selected { selected: SelectedPath },
    Error { message: String },
}

/// Which side of the exchange a bus message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusDirection {
    ToAgent,
    ToClient,
}

/// Signal relayed over the publish/subscribe bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub negotiation_id: Uuid,
    pub direction: BusDirection,
    pub signal: SignalMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_message_tags() {
        let msg = SignalMessage::Selected {
            selected: SelectedPath::Relay,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "selected");
        assert_eq!(value["selected"]["path"], "relay");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = BusEnvelope {
            negotiation_id: Uuid::new_v4(),
            direction: BusDirection::ToAgent,
            signal: SignalMessage::Offer {
                description: SessionDescription {
                    session_id: Uuid::new_v4(),
                    candidates: vec![Candidate::host("127.0.0.1:4000")],
                    ice_servers: vec![IceServer::new("turn:127.0.0.1:3478")],
                },
            },
        };

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: BusEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }
}
