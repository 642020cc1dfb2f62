//! Network identity updates
//!
//! Agents announce their [`Node`] over a message connection and the control
//! plane stores it. Nodes posted for an agent are published on the bus and
//! delivered to whichever control plane instance holds that agent's
//! connection.

use agentgate_broker::{agent_prefixed, strip_agent_prefix, BrokerError, Handler};
use agentgate_proto::Node;
use agentgate_relay_db::UpdateAgentNetwork;
use agentgate_transport::{MessageTransport, TransportError};
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::plane::ControlPlane;
use crate::{CloseStatus, ControlResult};

/// Bus topic carrying node updates
pub const TAILNET_TOPIC: &str = "tailnet";

enum Event {
    Posted(Option<Bytes>),
    Received(Result<Option<Bytes>, TransportError>),
}

/// Relay node updates between an agent connection, the bus and the store
pub async fn serve_agent_node<M>(plane: &ControlPlane, agent_id: Uuid, transport: &mut M) -> CloseStatus
where
    M: MessageTransport + ?Sized,
{
    let (tx, mut posted) = mpsc::unbounded_channel();
    let handler: Handler = Box::new(move |message: Bytes| {
        if let Some(payload) = strip_agent_prefix(agent_id, &message) {
            let _ = tx.send(Bytes::copy_from_slice(payload));
        }
    });

    let _subscription = match plane.bus().subscribe(TAILNET_TOPIC, handler).await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!(agent_id = %agent_id, "Failed to subscribe to node updates: {}", e);
            return CloseStatus::internal(e.to_string());
        }
    };
    let shutdown = plane.shutdown_token();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return CloseStatus::going_away(),
            message = posted.recv() => Event::Posted(message),
            message = transport.recv() => Event::Received(message),
        };

        match event {
            Event::Posted(Some(message)) => {
                if let Err(e) = transport.send(message).await {
                    debug!(agent_id = %agent_id, "Failed to forward node update: {}", e);
                    return CloseStatus::normal();
                }
            }
            Event::Posted(None) => return CloseStatus::internal("node subscription ended"),
            Event::Received(Ok(Some(message))) => {
                let node: Node = match serde_json::from_slice(&message) {
                    Ok(node) => node,
                    Err(e) => {
                        warn!(agent_id = %agent_id, "Invalid node update: {}", e);
                        return CloseStatus::abnormal(format!("invalid node: {}", e));
                    }
                };
                if let Err(e) = store_node(plane, agent_id, node).await {
                    warn!(agent_id = %agent_id, "Failed to store node: {}", e);
                    return CloseStatus::internal(format!("set agent keys: {}", e));
                }
            }
            Event::Received(Ok(None)) => return CloseStatus::normal(),
            Event::Received(Err(e)) => {
                debug!(agent_id = %agent_id, "Node connection failed: {}", e);
                return CloseStatus::normal();
            }
        }
    }
}

async fn store_node(plane: &ControlPlane, agent_id: Uuid, node: Node) -> ControlResult<()> {
    plane
        .store()
        .update_agent_network(UpdateAgentNetwork {
            id: agent_id,
            node_public_key: node.key,
            disco_public_key: node.disco_key,
            relay_latency: node.relay_latency,
            preferred_relay: node.preferred_relay,
            updated_at: Utc::now(),
        })
        .await?;
    Ok(())
}

/// Send networking information to an agent's node connection
pub async fn post_agent_node(plane: &ControlPlane, agent_id: Uuid, node: &Node) -> ControlResult<()> {
    let payload = serde_json::to_vec(node).map_err(BrokerError::from)?;
    plane
        .bus()
        .publish(TAILNET_TOPIC, agent_prefixed(agent_id, &payload))
        .await?;
    Ok(())
}
